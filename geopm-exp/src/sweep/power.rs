// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use log::warn;
use std::path::Path;
use std::rc::Rc;

use super::agent_conf;
use crate::app::{AppConf, LaunchConfig};
use geopm_exp_intf::{MachineRecord, Policy};
use geopm_util::*;

pub const POWER_POLICY_KEY: &str = "POWER_PACKAGE_LIMIT_TOTAL";
const DFL_POWER_STEP: f64 = 10.0;
const STEP_SLACK: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct PowerBounds {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl PowerBounds {
    /// `max` down to `min` in `step` decrements.
    pub fn values(&self) -> Vec<f64> {
        let nr = ((self.max - self.min) / self.step + STEP_SLACK).floor() as usize;
        (0..=nr).map(|i| self.max - i as f64 * self.step).collect()
    }
}

/// Unspecified bounds default to TDP at the top and to half of TDP,
/// but no lower than the hardware minimum, at the bottom. The default
/// bottom is rounded up to the step.
pub fn setup_power_bounds(
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
    mach: &MachineRecord,
) -> Result<PowerBounds> {
    let sys_min = mach.power_package_min()?;
    let sys_max = mach.power_package_max()?;
    let tdp = mach.power_package_tdp()?;

    let step = step.unwrap_or(DFL_POWER_STEP);
    if !(step > 0.0) {
        config_bail!("power step must be positive, got {}", step);
    }
    let max = max.unwrap_or(tdp);
    let min = match min {
        Some(v) => v,
        None => ((0.5 * tdp).max(sys_min) / step - STEP_SLACK).ceil() * step,
    };

    if min < sys_min || max > sys_max {
        config_bail!(
            "power range {}W-{}W is outside the hardware range {}W-{}W",
            min,
            max,
            sys_min,
            sys_max
        );
    }
    if min > max {
        config_bail!("power minimum {}W is above the maximum {}W", min, max);
    }
    let ratio = (max - min) / step;
    if (ratio - ratio.round()).abs() > STEP_SLACK {
        warn!(
            "sweep: power range {}W-{}W is not a multiple of the step {}W",
            min, max, step
        );
    }
    Ok(PowerBounds { min, max, step })
}

/// Every agent in `agents` for each budget, budgets from the top.
pub fn power_configs(
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
    bounds: &PowerBounds,
    agents: &[String],
) -> Result<Vec<LaunchConfig>> {
    if agents.is_empty() {
        config_bail!("power sweep needs at least one agent");
    }
    let mut configs = vec![];
    for power in bounds.values().into_iter() {
        let variant = format!("{:.0}w", power);
        for agent in agents.iter() {
            let policy = Policy::new().with(POWER_POLICY_KEY, power);
            let conf = agent_conf(output_dir, &**app, agent, &variant, policy)?;
            configs.push(LaunchConfig::new(app.clone(), Some(conf), &variant));
        }
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::FakeApp;

    fn machine() -> MachineRecord {
        let mut mach = MachineRecord::default();
        mach.set_signal("CPU_POWER_MIN_AVAIL", Some(70.0));
        mach.set_signal("CPU_POWER_LIMIT_DEFAULT", Some(275.0));
        mach.set_signal("CPU_POWER_MAX_AVAIL", Some(350.0));
        mach
    }

    #[test]
    fn test_power_bounds() {
        let mach = machine();
        for (min, max, step, expected) in &[
            (None, None, None, Some((140.0, 275.0, 10.0))),
            (None, None, Some(20.0), Some((140.0, 275.0, 20.0))),
            (Some(100.0), Some(300.0), Some(25.0), Some((100.0, 300.0, 25.0))),
            (Some(60.0), None, None, None),
            (None, Some(400.0), None, None),
            (Some(200.0), Some(150.0), None, None),
            (None, None, Some(-5.0), None),
        ] {
            let res = setup_power_bounds(*min, *max, *step, &mach);
            println!("{:?} {:?} {:?} -> {:?}", min, max, step, &res);
            match expected {
                Some((min, max, step)) => {
                    let b = res.unwrap();
                    assert_eq!((b.min, b.max, b.step), (*min, *max, *step));
                }
                None => assert!(res.unwrap_err().downcast_ref::<ExpError>().is_some()),
            }
        }

        let mut low = machine();
        low.set_signal("CPU_POWER_MIN_AVAIL", Some(143.0));
        let b = setup_power_bounds(None, None, None, &low).unwrap();
        assert_eq!(b.min, 150.0);
    }

    #[test]
    fn test_power_sweep_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let app: Rc<dyn AppConf> = Rc::new(FakeApp::new("fake"));
        let bounds = setup_power_bounds(Some(140.0), Some(200.0), Some(20.0), &machine()).unwrap();
        assert_eq!(bounds.values().len(), 4);

        let agents = vec!["power_governor".to_string(), "power_balancer".to_string()];
        let configs = power_configs(&app, dir.path(), &bounds, &agents).unwrap();
        let got: Vec<(f64, &str)> = configs
            .iter()
            .map(|c| {
                let agent = c.agent.as_ref().unwrap();
                (agent.policy().get(POWER_POLICY_KEY).unwrap(), agent.agent())
            })
            .collect();
        assert_eq!(
            got,
            vec![
                (200.0, "power_governor"),
                (200.0, "power_balancer"),
                (180.0, "power_governor"),
                (180.0, "power_balancer"),
                (160.0, "power_governor"),
                (160.0, "power_balancer"),
                (140.0, "power_governor"),
                (140.0, "power_balancer"),
            ]
        );
        assert_eq!(configs[1].name, "fake_power_balancer_200w");
        assert!(power_configs(&app, dir.path(), &bounds, &[]).is_err());
    }
}
