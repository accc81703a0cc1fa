// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use log::info;
use std::path::Path;
use std::rc::Rc;

use super::agent_conf;
use crate::app::{AppConf, LaunchConfig};
use geopm_exp_intf::{MachineRecord, Policy, TunedConfig};
use geopm_util::*;

pub const CPU_ACTIVITY_AGENT: &str = "cpu_activity";
pub const GPU_ACTIVITY_AGENT: &str = "gpu_activity";

pub const CPU_EFFICIENT_KEY: &str = "CPU_FREQUENCY_EFFICIENT_HIGH_INTENSITY";
pub const UNCORE_EFFICIENT_KEY: &str = "CPU_UNCORE_FREQUENCY_EFFICIENT_HIGH_INTENSITY";
pub const GPU_EFFICIENT_KEY: &str = "GPU_CORE_FREQUENCY_EFFICIENT_HIGH_INTENSITY";

/// `0.0, 0.1, ... 1.0` unless `phis` is given.
pub fn phi_values(phis: Option<&[f64]>) -> Result<Vec<f64>> {
    match phis {
        Some(phis) => {
            if phis.is_empty() {
                config_bail!("phi list is empty");
            }
            for phi in phis.iter() {
                if !(0.0..=1.0).contains(phi) {
                    config_bail!("phi {} is outside [0, 1]", phi);
                }
            }
            Ok(phis.to_vec())
        }
        None => Ok((0..=10).map(|i| i as f64 / 10.0).collect()),
    }
}

pub fn phi_variant(phi: f64) -> String {
    format!("phi{}", (phi * 100.0).round() as i64)
}

/// Fixed part of the activity agent policies. Efficient frequencies come
/// from a tuned configuration when one is given and fall back to the
/// hardware minimums.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhiInputs {
    pub cpu_max: f64,
    pub cpu_eff: f64,
    pub uncore_max: f64,
    pub uncore_eff: f64,
    pub mem_bw: Vec<(f64, f64)>,
    pub gpu_max: f64,
    pub gpu_eff: f64,
}

fn tuned_or(tuned: Option<&TunedConfig>, key: &str, dfl: f64) -> f64 {
    match tuned.and_then(|t| t.get_value(key)) {
        Some(v) => v,
        None => {
            info!("sweep: {} not tuned, using {}", key, format_si(dfl));
            dfl
        }
    }
}

impl PhiInputs {
    pub fn cpu(mach: &MachineRecord, tuned: Option<&TunedConfig>) -> Result<Self> {
        let cpu_max = mach.frequency_max()?;
        let uncore_max = mach.uncore_frequency_max()?;
        let cpu_eff = tuned_or(tuned, CPU_EFFICIENT_KEY, mach.frequency_min()?);
        let uncore_eff = tuned_or(tuned, UNCORE_EFFICIENT_KEY, mach.uncore_frequency_min()?);
        if cpu_eff > cpu_max || uncore_eff > uncore_max {
            config_bail!(
                "efficient frequencies {}/{} exceed the maximums {}/{}",
                format_si(cpu_eff),
                format_si(uncore_eff),
                format_si(cpu_max),
                format_si(uncore_max)
            );
        }
        Ok(Self {
            cpu_max,
            cpu_eff,
            uncore_max,
            uncore_eff,
            mem_bw: tuned.map(|t| t.mem_bw_table()).unwrap_or_default(),
            ..Default::default()
        })
    }

    pub fn gpu(mach: &MachineRecord, tuned: Option<&TunedConfig>) -> Result<Self> {
        if mach.num_gpu() == 0 {
            config_bail!("gpu phi sweep needs GPUs");
        }
        let gpu_max = mach.gpu_frequency_max()?;
        let gpu_eff = tuned_or(tuned, GPU_EFFICIENT_KEY, mach.gpu_frequency_min()?);
        if gpu_eff > gpu_max {
            config_bail!(
                "efficient GPU frequency {} exceeds the maximum {}",
                format_si(gpu_eff),
                format_si(gpu_max)
            );
        }
        Ok(Self {
            gpu_max,
            gpu_eff,
            ..Default::default()
        })
    }

    fn cpu_policy(&self, phi: f64) -> Policy {
        let mut policy = Policy::new()
            .with("CPU_FREQ_MAX", self.cpu_max)
            .with("CPU_FREQ_EFFICIENT", self.cpu_eff)
            .with("CPU_UNCORE_FREQ_MAX", self.uncore_max)
            .with("CPU_UNCORE_FREQ_EFFICIENT", self.uncore_eff)
            .with("CPU_PHI", phi);
        for (idx, (freq, bw)) in self.mem_bw.iter().enumerate() {
            policy.set(&format!("CPU_UNCORE_FREQ_{}", idx), *freq);
            policy.set(&format!("MAX_MEMORY_BANDWIDTH_{}", idx), *bw);
        }
        policy
    }

    fn gpu_policy(&self, phi: f64) -> Policy {
        Policy::new()
            .with("GPU_FREQ_MAX", self.gpu_max)
            .with("GPU_FREQ_EFFICIENT", self.gpu_eff)
            .with("GPU_PHI", phi)
    }
}

fn phi_configs<F>(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    agent: &str,
    phis: Option<&[f64]>,
    policy_fn: F,
) -> Result<Vec<LaunchConfig>>
where
    F: Fn(f64) -> Policy,
{
    let mut configs = vec![];
    for phi in phi_values(phis)?.into_iter() {
        let variant = phi_variant(phi);
        let conf = agent_conf(output_dir, &**app, agent, &variant, policy_fn(phi))?;
        configs.push(LaunchConfig::new(app.clone(), Some(conf), &variant));
    }
    Ok(configs)
}

pub fn cpu_phi_configs(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    inputs: &PhiInputs,
    phis: Option<&[f64]>,
) -> Result<Vec<LaunchConfig>> {
    phi_configs(app, output_dir, CPU_ACTIVITY_AGENT, phis, |phi| inputs.cpu_policy(phi))
}

pub fn gpu_phi_configs(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    inputs: &PhiInputs,
    phis: Option<&[f64]>,
) -> Result<Vec<LaunchConfig>> {
    phi_configs(app, output_dir, GPU_ACTIVITY_AGENT, phis, |phi| inputs.gpu_policy(phi))
}

/// The endpoint supplies everything but phi.
pub fn endpoint_phi_configs(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    phis: Option<&[f64]>,
) -> Result<Vec<LaunchConfig>> {
    phi_configs(app, output_dir, CPU_ACTIVITY_AGENT, phis, |phi| {
        Policy::new().with("CPU_PHI", phi)
    })
}
