// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use log::warn;
use std::path::Path;
use std::rc::Rc;

use super::agent_conf;
use crate::app::{AppConf, LaunchConfig};
use geopm_exp_intf::{Args, MachineRecord, Policy};
use geopm_util::*;

pub const FREQ_AGENT: &str = "frequency_map";
const STEP_SLACK: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreqAxis {
    Core,
    Uncore,
    Gpu,
}

impl FreqAxis {
    pub fn policy_key(&self) -> &'static str {
        match self {
            Self::Core => "FREQ_CPU_DEFAULT",
            Self::Uncore => "FREQ_CPU_UNCORE",
            Self::Gpu => "FREQ_GPU_DEFAULT",
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Core => "c",
            Self::Uncore => "u",
            Self::Gpu => "g",
        }
    }
}

/// Validated sweep range. `turbo` is swept ahead of `max` when set.
#[derive(Debug, Clone, PartialEq)]
pub struct FreqBounds {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub turbo: Option<f64>,
}

impl FreqBounds {
    /// Step spaced values from `min` up to `max`, emitted high to low.
    pub fn values(&self) -> Vec<f64> {
        let nr = ((self.max - self.min) / self.step + STEP_SLACK).floor() as usize;
        let mut vals: Vec<f64> = (0..=nr).map(|i| self.min + i as f64 * self.step).collect();
        vals.reverse();
        if let Some(turbo) = self.turbo {
            vals.insert(0, turbo);
        }
        vals
    }
}

fn is_multiple(val: f64, unit: f64) -> bool {
    let ratio = val / unit;
    (ratio - ratio.round()).abs() < STEP_SLACK
}

/// Resolve the sweep range of `axis` from the command line and the
/// machine record. Unspecified bounds come from the hardware: the
/// minimum, the sticker frequency for the core axis and the maximum
/// otherwise, and the hardware step. The uncore has no step of its own
/// and uses the core's.
pub fn setup_frequency_bounds(axis: FreqAxis, args: &Args, mach: &MachineRecord) -> Result<FreqBounds> {
    let (sys_min, sys_max, dfl_max, hw_step, user) = match axis {
        FreqAxis::Core => (
            mach.frequency_min()?,
            mach.frequency_max()?,
            mach.frequency_sticker()?,
            mach.frequency_step()?,
            (args.min_frequency, args.max_frequency, args.step_frequency),
        ),
        FreqAxis::Uncore => (
            mach.uncore_frequency_min()?,
            mach.uncore_frequency_max()?,
            mach.uncore_frequency_max()?,
            mach.frequency_step()?,
            (
                args.min_uncore_frequency,
                args.max_uncore_frequency,
                args.step_uncore_frequency,
            ),
        ),
        FreqAxis::Gpu => (
            mach.gpu_frequency_min()?,
            mach.gpu_frequency_max()?,
            mach.gpu_frequency_max()?,
            mach.gpu_frequency_step()?,
            (args.min_gpu_frequency, args.max_gpu_frequency, args.step_gpu_frequency),
        ),
    };
    let (min, max, step) = (
        user.0.unwrap_or(sys_min),
        user.1.unwrap_or(dfl_max),
        user.2.unwrap_or(hw_step),
    );
    let what = format!("{:?} frequency", axis);

    if min < sys_min || max > sys_max {
        config_bail!(
            "{} range {}-{} is outside the hardware range {}-{}",
            &what,
            format_si(min),
            format_si(max),
            format_si(sys_min),
            format_si(sys_max)
        );
    }
    if min > max {
        config_bail!("{} minimum {} is above the maximum {}", &what, format_si(min), format_si(max));
    }
    if !(step > 0.0) {
        config_bail!("{} step must be positive, got {}", &what, step);
    }
    if !is_multiple(max - min, step) {
        warn!(
            "sweep: {} range {}-{} is not a multiple of the step {}",
            &what,
            format_si(min),
            format_si(max),
            format_si(step)
        );
    }
    if hw_step > 0.0 && !is_multiple(step, hw_step) {
        warn!(
            "sweep: {} step {} is not a multiple of the hardware step {}",
            &what,
            format_si(step),
            format_si(hw_step)
        );
    }

    let turbo = match axis {
        FreqAxis::Core if args.run_max_turbo && sys_max > max => Some(sys_max),
        _ => None,
    };
    Ok(FreqBounds { min, max, step, turbo })
}

/// Frequency in GHz with trailing zeros dropped, "2.4" or "2.45".
pub fn freq_label(freq: f64) -> String {
    let mut label = format!("{:.3}", freq / 1e9);
    while label.ends_with('0') && !label.ends_with(".0") {
        label.pop();
    }
    label
}

fn axis_configs(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    axis: FreqAxis,
    values: &[f64],
) -> Result<Vec<LaunchConfig>> {
    let mut configs = vec![];
    for freq in values.iter() {
        let variant = format!("{}{}", freq_label(*freq), axis.suffix());
        let policy = Policy::new().with(axis.policy_key(), *freq);
        let agent = agent_conf(output_dir, &**app, FREQ_AGENT, &variant, policy)?;
        configs.push(LaunchConfig::new(app.clone(), Some(agent), &variant));
    }
    Ok(configs)
}

pub fn frequency_configs(app: &Rc<dyn AppConf>, output_dir: &Path, bounds: &FreqBounds) -> Result<Vec<LaunchConfig>> {
    axis_configs(app, output_dir, FreqAxis::Core, &bounds.values())
}

pub fn uncore_frequency_configs(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    bounds: &FreqBounds,
) -> Result<Vec<LaunchConfig>> {
    axis_configs(app, output_dir, FreqAxis::Uncore, &bounds.values())
}

pub fn gpu_frequency_configs(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    bounds: &FreqBounds,
) -> Result<Vec<LaunchConfig>> {
    axis_configs(app, output_dir, FreqAxis::Gpu, &bounds.values())
}

/// Core major cartesian product. The GPU axis is left out entirely on
/// machines without GPUs.
pub fn combined_frequency_configs(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    core: &[f64],
    uncore: &[f64],
    gpu: Option<&[f64]>,
) -> Result<Vec<LaunchConfig>> {
    let mut configs = vec![];
    for cf in core.iter() {
        for uf in uncore.iter() {
            let base = format!(
                "{}{}_{}{}",
                freq_label(*cf),
                FreqAxis::Core.suffix(),
                freq_label(*uf),
                FreqAxis::Uncore.suffix()
            );
            let policy = Policy::new()
                .with(FreqAxis::Core.policy_key(), *cf)
                .with(FreqAxis::Uncore.policy_key(), *uf);
            let points: Vec<(String, Policy)> = match gpu {
                Some(gpu) => gpu
                    .iter()
                    .map(|gf| {
                        (
                            format!("{}_{}{}", &base, freq_label(*gf), FreqAxis::Gpu.suffix()),
                            policy.clone().with(FreqAxis::Gpu.policy_key(), *gf),
                        )
                    })
                    .collect(),
                None => vec![(base, policy)],
            };
            for (variant, policy) in points.into_iter() {
                let agent = agent_conf(output_dir, &**app, FREQ_AGENT, &variant, policy)?;
                configs.push(LaunchConfig::new(app.clone(), Some(agent), &variant));
            }
        }
    }
    Ok(configs)
}
