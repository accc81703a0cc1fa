// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::app::AppConf;
use super::machine::PlatformIo;
use super::report::{RawReportCollection, Row, Table, PKG_ENERGY_KEYS};
use super::run::{CommandRunner, RunOpts};
use super::sweep::phi::{CPU_EFFICIENT_KEY, GPU_EFFICIENT_KEY, UNCORE_EFFICIENT_KEY};
use super::sweep::{
    combined_frequency_configs, gpu_frequency_configs, launch_all, setup_frequency_bounds, FreqAxis,
};
use geopm_exp_intf::{write_init_control, Args, MachineRecord, TunedConfig, TunedConst, MEM_BW_INIT_CONTROL};
use geopm_util::*;

pub const TUNED_CONFIG_FILENAME: &str = "const_config_io-characterization.json";
pub const UNCORE_SWEEP_DIR: &str = "uncore_frequency_sweep";
pub const CORE_SWEEP_DIR: &str = "core_frequency_sweep";
pub const GPU_SWEEP_DIR: &str = "gpu_frequency_sweep";
pub const MEM_BW_INIT_CONTROL_FILENAME: &str = "mem_bw.init-control";

pub const CPU_REPORT_SIGNALS: &[&str] = &[
    "CPU_UNCORE_FREQUENCY_STATUS@package",
    "MSR::QM_CTR_SCALED_RATE@package",
    "CPU_UNCORE_FREQUENCY_MAX_CONTROL@package",
    "CPU_UNCORE_FREQUENCY_MIN_CONTROL@package",
];
const UNCORE_STATUS_PREFIX: &str = "CPU_UNCORE_FREQUENCY_STATUS@package-";
const MEM_BW_PREFIX: &str = "MSR::QM_CTR_SCALED_RATE@package-";
const ACHIEVED_FREQ_KEY: &str = "frequency (Hz)";
const ACHIEVED_UNCORE_KEY: &str = "uncore-frequency (Hz)";
const ACHIEVED_GPU_KEYS: &[&str] = &["gpu-frequency (Hz)", "GPU_CORE_FREQUENCY_STATUS"];
const GPU_ENERGY_KEYS: &[&str] = &["gpu-energy (J)", "GPU_ENERGY (J)", "GPU_ENERGY"];
const NEAR_TIE: f64 = 0.05;

fn round_to_step(val: f64, step: f64) -> f64 {
    if step > 0.0 {
        (val / step).round() * step
    } else {
        val
    }
}

/// Pick the lowest frequency whose mean energy is within `(1 + margin)`
/// of the lowest mean energy. `points` are `(frequency, energy)` samples,
/// repeated trials of the same frequency are averaged.
pub fn energy_efficient_frequency(points: &[(f64, f64)], margin: f64) -> Result<f64> {
    // Frequencies are whole Hz so integer keys group them exactly.
    let mut acc = BTreeMap::<i64, (f64, usize)>::new();
    for (freq, energy) in points.iter() {
        let ent = acc.entry(freq.round() as i64).or_insert((0.0, 0));
        ent.0 += energy;
        ent.1 += 1;
    }
    if acc.is_empty() {
        config_bail!("no energy samples to pick a frequency from");
    }
    let means: Vec<(f64, f64)> = acc
        .into_iter()
        .map(|(freq, (sum, nr))| (freq as f64, sum / nr as f64))
        .collect();

    let min_energy = means.iter().map(|(_, e)| *e).fold(std::f64::INFINITY, f64::min);
    let limit = min_energy * (1.0 + margin);
    let (best_freq, best_energy) = match means.iter().find(|(_, e)| *e <= limit) {
        Some(v) => *v,
        None => config_bail!("energy means aren't comparable"),
    };

    if margin == 0.0 {
        for (freq, energy) in means.iter() {
            if *freq != best_freq && *energy <= best_energy * (1.0 + NEAR_TIE) {
                warn!(
                    "characterize: {} is within {}% of the energy at the selected {}",
                    format_si(*freq),
                    format_pct(NEAR_TIE),
                    format_si(best_freq)
                );
            }
        }
    }
    Ok(best_freq)
}

/// Achieved frequency of `axis` rounded to `step`. Reports without the
/// achieved value fall back to the requested policy value.
fn row_frequency(row: &Row, axis: FreqAxis, step: f64) -> Option<f64> {
    let achieved = match axis {
        FreqAxis::Core => row.get_f64(ACHIEVED_FREQ_KEY),
        FreqAxis::Uncore => row
            .get_f64(ACHIEVED_UNCORE_KEY)
            .or_else(|| package_mean(row, UNCORE_STATUS_PREFIX)),
        FreqAxis::Gpu => row.get_f64_any(ACHIEVED_GPU_KEYS),
    };
    match achieved {
        Some(v) => Some(round_to_step(v, step)),
        None => row.get_f64(axis.policy_key()),
    }
}

/// `(frequency, package or GPU energy)` of every sample of `region`.
fn region_points(df: &Table, region: &str, axis: FreqAxis, energy_keys: &[&str], step: f64) -> Result<Vec<(f64, f64)>> {
    let rows = df.filter(|r| r.get("region") == Some(region));
    if rows.is_empty() {
        config_bail!("region {:?} is missing from the reports", region);
    }
    let mut points = vec![];
    for row in rows.rows.iter() {
        if let (Some(freq), Some(energy)) = (row_frequency(row, axis, step), row.get_f64_any(energy_keys)) {
            points.push((freq, energy));
        }
    }
    if points.is_empty() {
        config_bail!("region {:?} has no frequency and energy samples", region);
    }
    Ok(points)
}

fn warn_if_sparse(points: &[(f64, f64)], expected: usize, what: &str) {
    let mut freqs: Vec<i64> = points.iter().map(|(f, _)| f.round() as i64).collect();
    freqs.sort();
    freqs.dedup();
    if freqs.len() < expected {
        warn!(
            "characterize: Only {} distinct {} frequencies, expected {}",
            freqs.len(),
            what,
            expected
        );
    }
}

/// Per package mean of the `prefix<N>` columns of a row.
fn package_mean(row: &Row, prefix: &str) -> Option<f64> {
    let vals: Vec<f64> = row
        .keys()
        .filter(|k| k.starts_with(prefix))
        .filter_map(|k| row.get_f64(k))
        .collect();
    match vals.len() {
        0 => None,
        nr => Some(vals.iter().sum::<f64>() / nr as f64),
    }
}

/// Mean memory bandwidth of `region` for each achieved uncore frequency,
/// rounded to `step`, in ascending frequency order.
pub fn mem_bw_table(df: &Table, region: &str, step: f64) -> Vec<(f64, f64)> {
    let mut acc = BTreeMap::<i64, (f64, usize)>::new();
    for row in df.rows.iter().filter(|r| r.get("region") == Some(region)) {
        if let (Some(uncore), Some(bw)) = (
            row_frequency(row, FreqAxis::Uncore, step),
            package_mean(row, MEM_BW_PREFIX),
        ) {
            let ent = acc.entry(uncore.round() as i64).or_insert((0.0, 0));
            ent.0 += bw;
            ent.1 += 1;
        }
    }
    acc.into_iter()
        .map(|(freq, (sum, nr))| (freq as f64, sum / nr as f64))
        .collect()
}

#[derive(Debug, Clone)]
pub struct CpuCharOpts {
    pub mem_region: String,
    pub compute_region: String,
    pub core_margin: f64,
    pub uncore_margin: f64,
    pub hw_step: f64,
    pub nr_uncore: usize,
    pub nr_core: usize,
}

/// Efficient uncore frequency from the memory bound region of the uncore
/// sweep.
pub fn efficient_uncore(uncore_df: &Table, opts: &CpuCharOpts) -> Result<f64> {
    let points = region_points(uncore_df, &opts.mem_region, FreqAxis::Uncore, PKG_ENERGY_KEYS, opts.hw_step)?;
    warn_if_sparse(&points, opts.nr_uncore, "uncore");
    let uncore_eff = energy_efficient_frequency(&points, opts.uncore_margin)?;
    info!("characterize: Efficient uncore frequency is {}", format_si(uncore_eff));
    Ok(uncore_eff)
}

/// Core selection on the compute bound region of the core sweep, limited
/// to the samples which ran at `uncore_eff`.
pub fn cpu_tuned_config(
    uncore_df: &Table,
    core_df: &Table,
    uncore_eff: f64,
    opts: &CpuCharOpts,
) -> Result<TunedConfig> {
    let pinned = core_df.filter(|r| match row_frequency(r, FreqAxis::Uncore, opts.hw_step) {
        Some(u) => (u - uncore_eff).abs() < 0.5,
        None => true,
    });
    let points = region_points(&pinned, &opts.compute_region, FreqAxis::Core, PKG_ENERGY_KEYS, opts.hw_step)?;
    warn_if_sparse(&points, opts.nr_core, "core");
    let core_eff = energy_efficient_frequency(&points, opts.core_margin)?;
    info!("characterize: Efficient core frequency is {}", format_si(core_eff));

    let mut tuned = TunedConfig::new();
    tuned.insert(
        CPU_EFFICIENT_KEY,
        TunedConst::board("Most energy efficient core frequency for compute bound work", "hertz", core_eff),
    );
    tuned.insert(
        UNCORE_EFFICIENT_KEY,
        TunedConst::board("Most energy efficient uncore frequency for memory bound work", "hertz", uncore_eff),
    );
    for (idx, (freq, bw)) in mem_bw_table(uncore_df, &opts.mem_region, opts.hw_step).into_iter().enumerate() {
        tuned.insert(
            &format!("CPU_UNCORE_FREQUENCY_{}", idx),
            TunedConst::board("Uncore frequency of a memory bandwidth sample", "hertz", freq),
        );
        tuned.insert(
            &format!("CPU_UNCORE_MAX_MEMORY_BANDWIDTH_{}", idx),
            TunedConst::board("Mean memory bandwidth in bytes per second at the uncore frequency", "none", bw),
        );
    }
    Ok(tuned)
}

pub fn gpu_tuned_config(df: &Table, region: &str, margin: f64, step: f64, nr_freqs: usize) -> Result<TunedConfig> {
    let points = region_points(df, region, FreqAxis::Gpu, GPU_ENERGY_KEYS, step)?;
    warn_if_sparse(&points, nr_freqs, "GPU");
    let gpu_eff = energy_efficient_frequency(&points, margin)?;
    info!("characterize: Efficient GPU frequency is {}", format_si(gpu_eff));

    let mut tuned = TunedConfig::new();
    tuned.insert(
        GPU_EFFICIENT_KEY,
        TunedConst::board("Most energy efficient GPU core frequency", "hertz", gpu_eff),
    );
    Ok(tuned)
}

fn sub_opts(opts: &RunOpts, subdir: &str) -> Result<RunOpts> {
    let mut sub = RunOpts::new(opts.output_dir.join(subdir))?;
    sub.node_count = opts.node_count;
    sub.extra_args = opts.extra_args.clone();
    sub.enable_traces = opts.enable_traces;
    sub.enable_profile_traces = opts.enable_profile_traces;
    sub.init_control = opts.init_control.clone();
    sub.exec_wrapper = opts.exec_wrapper.clone();
    sub.geopm_version = opts.geopm_version.clone();
    Ok(sub)
}

fn save_tuned(tuned: &TunedConfig, output_dir: &Path, merge: Option<&String>) -> Result<PathBuf> {
    let path = output_dir.join(TUNED_CONFIG_FILENAME);
    tuned.save(&path)?;
    info!("characterize: Wrote {:?}", &path);
    if let Some(merge) = merge {
        tuned.merge_into(merge)?;
        info!("characterize: Merged into {:?}", merge);
    }
    Ok(path)
}

/// Sweep steps default to twice the hardware step.
fn char_args(args: &Args, mach: &MachineRecord) -> Result<Args> {
    let mut args = args.clone();
    let hw_step = mach.frequency_step()?;
    if args.step_frequency.is_none() {
        args.step_frequency = Some(2.0 * hw_step);
    }
    if args.step_uncore_frequency.is_none() {
        args.step_uncore_frequency = Some(2.0 * hw_step);
    }
    if args.step_gpu_frequency.is_none() && mach.num_gpu() > 0 {
        args.step_gpu_frequency = Some(2.0 * mach.gpu_frequency_step()?);
    }
    Ok(args)
}

/// Frequencies swept by the two CPU characterization passes.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuPasses {
    /// Core frequency held through the uncore pass.
    pub pinned_core: f64,
    pub uncore: Vec<f64>,
    pub core: Vec<f64>,
}

/// The uncore pass holds the core at the sticker frequency. The core pass
/// reaches up to the maximum available frequency unless capped.
pub fn cpu_passes(args: &Args, mach: &MachineRecord) -> Result<CpuPasses> {
    let mut cargs = char_args(args, mach)?;
    cargs.run_max_turbo = false;
    let uncore = setup_frequency_bounds(FreqAxis::Uncore, &cargs, mach)?.values();
    if cargs.max_frequency.is_none() {
        cargs.max_frequency = Some(mach.frequency_max()?);
    }
    let core = setup_frequency_bounds(FreqAxis::Core, &cargs, mach)?.values();
    Ok(CpuPasses {
        pinned_core: mach.frequency_sticker()?,
        uncore,
        core,
    })
}

/// Uncore pass at the sticker core frequency, then a core pass with the
/// uncore pinned to the winner of the first.
pub fn characterize_cpu(
    args: &Args,
    mach: &MachineRecord,
    app: &Rc<dyn AppConf>,
    opts: &RunOpts,
    runner: &mut dyn CommandRunner,
    pio: &dyn PlatformIo,
) -> Result<TunedConfig> {
    let passes = cpu_passes(args, mach)?;

    let init_control = opts.output_dir.join(MEM_BW_INIT_CONTROL_FILENAME);
    write_init_control(&init_control, MEM_BW_INIT_CONTROL)?;
    let mut base = opts.clone();
    base.init_control = Some(init_control);
    base.extra_args
        .push(format!("--geopm-report-signals={}", CPU_REPORT_SIGNALS.join(",")));

    let uncore_opts = sub_opts(&base, UNCORE_SWEEP_DIR)?;
    let configs = combined_frequency_configs(
        app,
        &uncore_opts.output_dir,
        &[passes.pinned_core],
        &passes.uncore,
        None,
    )?;
    info!("characterize: Uncore pass, {} frequencies", passes.uncore.len());
    launch_all(&configs, args.trial_count, args.cool_off_time, &uncore_opts, runner, pio)?;
    let uncore_df = RawReportCollection::new(&args.report_glob, &uncore_opts.output_dir)?.get_df();

    let char_opts = CpuCharOpts {
        mem_region: args.mem_region.clone(),
        compute_region: args.compute_region.clone(),
        core_margin: args.core_energy_margin,
        uncore_margin: args.uncore_energy_margin,
        hw_step: mach.frequency_step()?,
        nr_uncore: passes.uncore.len(),
        nr_core: passes.core.len(),
    };
    let uncore_eff = efficient_uncore(&uncore_df, &char_opts)?;

    let core_opts = sub_opts(&base, CORE_SWEEP_DIR)?;
    let configs = combined_frequency_configs(app, &core_opts.output_dir, &passes.core, &[uncore_eff], None)?;
    info!(
        "characterize: Core pass, {} frequencies at uncore {}",
        passes.core.len(),
        format_si(uncore_eff)
    );
    launch_all(&configs, args.trial_count, args.cool_off_time, &core_opts, runner, pio)?;
    let core_df = RawReportCollection::new(&args.report_glob, &core_opts.output_dir)?.get_df();

    let tuned = cpu_tuned_config(&uncore_df, &core_df, uncore_eff, &char_opts)?;
    save_tuned(&tuned, &opts.output_dir, args.merge_config.as_ref())?;
    Ok(tuned)
}

pub fn characterize_gpu(
    args: &Args,
    mach: &MachineRecord,
    app: &Rc<dyn AppConf>,
    opts: &RunOpts,
    runner: &mut dyn CommandRunner,
    pio: &dyn PlatformIo,
) -> Result<TunedConfig> {
    if mach.num_gpu() == 0 {
        config_bail!("GPU characterization needs GPUs");
    }
    let cargs = char_args(args, mach)?;
    let gpu_opts = sub_opts(opts, GPU_SWEEP_DIR)?;
    let bounds = setup_frequency_bounds(FreqAxis::Gpu, &cargs, mach)?;
    let configs = gpu_frequency_configs(app, &gpu_opts.output_dir, &bounds)?;
    launch_all(&configs, args.trial_count, args.cool_off_time, &gpu_opts, runner, pio)?;

    let df = RawReportCollection::new(&args.report_glob, &gpu_opts.output_dir)?.get_df();
    let tuned = gpu_tuned_config(
        &df,
        &args.gpu_region,
        args.gpu_energy_margin,
        mach.gpu_frequency_step()?,
        bounds.values().len(),
    )?;
    save_tuned(&tuned, &opts.output_dir, args.merge_config.as_ref())?;
    Ok(tuned)
}
