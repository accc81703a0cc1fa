// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{bail, Result};
use log::{info, warn};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use super::app::{AppConf, LaunchConfig};
use super::machine::{self, PlatformIo};
use super::run::{run_one, CommandRunner, RunOpts};
use geopm_exp_intf::{AgentConf, Args, MachineRecord, Mode, Policy, TunedConfig};
use geopm_util::*;

pub mod frequency;
pub mod phi;
pub mod power;

pub use frequency::{
    combined_frequency_configs, frequency_configs, gpu_frequency_configs, setup_frequency_bounds,
    uncore_frequency_configs, FreqAxis, FreqBounds,
};
pub use phi::{cpu_phi_configs, endpoint_phi_configs, gpu_phi_configs, phi_values, PhiInputs};
pub use power::{power_configs, setup_power_bounds, PowerBounds};

/// `<output_dir>/<config name>_agent.config`
pub fn agent_conf(output_dir: &Path, app: &dyn AppConf, agent: &str, variant: &str, policy: Policy) -> Result<AgentConf> {
    let name = format!("{}_{}_{}", app.name(), agent, variant);
    AgentConf::new(output_dir.join(format!("{}_agent.config", name)), agent, policy)
}

pub fn monitor_configs(app: &Rc<dyn AppConf>) -> Vec<LaunchConfig> {
    vec![LaunchConfig::new(app.clone(), Some(AgentConf::monitor()), "default")]
}

/// Launch configurations for the sweep `args.mode` names.
pub fn build_configs(
    args: &Args,
    mach: &MachineRecord,
    app: &Rc<dyn AppConf>,
    output_dir: &Path,
) -> Result<Vec<LaunchConfig>> {
    let tuned = match args.tuned_config.as_ref() {
        Some(path) => Some(TunedConfig::load(path)?),
        None => None,
    };

    Ok(match args.mode {
        Mode::Frequency => {
            let bounds = setup_frequency_bounds(FreqAxis::Core, args, mach)?;
            frequency_configs(app, output_dir, &bounds)?
        }
        Mode::UncoreFrequency => {
            let bounds = setup_frequency_bounds(FreqAxis::Uncore, args, mach)?;
            uncore_frequency_configs(app, output_dir, &bounds)?
        }
        Mode::GpuFrequency => {
            let bounds = setup_frequency_bounds(FreqAxis::Gpu, args, mach)?;
            gpu_frequency_configs(app, output_dir, &bounds)?
        }
        Mode::CombinedFrequency => {
            let core = setup_frequency_bounds(FreqAxis::Core, args, mach)?;
            let uncore = setup_frequency_bounds(FreqAxis::Uncore, args, mach)?;
            let gpu = match mach.num_gpu() {
                0 => None,
                _ => Some(setup_frequency_bounds(FreqAxis::Gpu, args, mach)?),
            };
            combined_frequency_configs(app, output_dir, &core.values(), &uncore.values(), gpu.map(|g| g.values()).as_deref())?
        }
        Mode::Power => {
            let bounds = setup_power_bounds(args.min_power, args.max_power, args.step_power, mach)?;
            power_configs(app, output_dir, &bounds, &args.agent_list)?
        }
        Mode::CpuPhi => {
            let inputs = PhiInputs::cpu(mach, tuned.as_ref())?;
            cpu_phi_configs(app, output_dir, &inputs, args.phi_list.as_deref())?
        }
        Mode::GpuPhi => {
            let inputs = PhiInputs::gpu(mach, tuned.as_ref())?;
            gpu_phi_configs(app, output_dir, &inputs, args.phi_list.as_deref())?
        }
        Mode::EndpointPhi => endpoint_phi_configs(app, output_dir, args.phi_list.as_deref())?,
        Mode::Monitor => monitor_configs(app),
        mode => bail!("{:?} doesn't map to a single sweep", mode),
    })
}

/// Run every configuration `iterations` times, iteration major, then
/// tear down each distinct adapter once. The first failure aborts the
/// remaining runs.
pub fn launch_all(
    configs: &[LaunchConfig],
    iterations: usize,
    cool_off: f64,
    opts: &RunOpts,
    runner: &mut dyn CommandRunner,
    pio: &dyn PlatformIo,
) -> Result<()> {
    machine::init(&opts.output_dir, pio)?;

    let nr_runs = iterations * configs.len();
    let mut result = Ok(());
    let mut nr_done = 0;
    'outer: for iteration in 0..iterations {
        for config in configs.iter() {
            let run_id = config.run_id(iteration);
            info!("sweep: [{}/{}] {}", nr_done + 1, nr_runs, &run_id);
            if let Err(e) = run_one(runner, config, &run_id, opts) {
                result = Err(e);
                break 'outer;
            }
            nr_done += 1;

            if nr_done < nr_runs && cool_off > 0.0 {
                if !sleep_unless_exiting(Duration::from_secs_f64(cool_off)) {
                    result = Err(anyhow::anyhow!("sweep: Interrupted after {}", &run_id));
                    break 'outer;
                }
            }
        }
    }

    let mut torn_down: Vec<&Rc<dyn AppConf>> = vec![];
    for config in configs.iter() {
        if torn_down.iter().any(|app| Rc::ptr_eq(app, &config.app)) {
            continue;
        }
        torn_down.push(&config.app);
        if let Err(e) = config.app.experiment_teardown(&opts.output_dir) {
            warn!("sweep: Experiment teardown of {} failed ({:#})", config.app.name(), &e);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::FakeApp;
    use crate::machine::tests::FakePlatformIo;
    use crate::run::tests::FakeRunner;

    fn fake_configs(apps: &[Rc<dyn AppConf>], variants: &[&str]) -> Vec<LaunchConfig> {
        let mut configs = vec![];
        for app in apps.iter() {
            for v in variants.iter() {
                configs.push(LaunchConfig::new(app.clone(), Some(AgentConf::monitor()), v));
            }
        }
        configs
    }

    #[test]
    fn test_launch_all_counts() {
        let dir = tempfile::TempDir::new().unwrap();
        let opts = RunOpts::new(dir.path()).unwrap();
        let a = Rc::new(FakeApp::new("a"));
        let b = Rc::new(FakeApp::new("b"));
        let apps: Vec<Rc<dyn AppConf>> = vec![a.clone(), b.clone()];
        let configs = fake_configs(&apps, &["x", "y", "z"]);

        let mut runner = FakeRunner::default();
        launch_all(&configs, 3, 0.0, &opts, &mut runner, &FakePlatformIo::new()).unwrap();

        assert_eq!(runner.launches.len(), 3 * 6);
        for app in &[&a, &b] {
            assert_eq!(app.count("setup"), 9);
            assert_eq!(app.count("teardown"), 9);
            assert_eq!(app.count("experiment_teardown"), 1);
        }
        // iteration major, config order within an iteration
        let profiles: Vec<String> = runner
            .launches
            .iter()
            .map(|(argv, _)| {
                argv.iter()
                    .find_map(|x| x.strip_prefix("--geopm-profile=").map(|x| x.to_string()))
                    .unwrap()
            })
            .collect();
        assert_eq!(profiles[0], "a_monitor_x_0");
        assert_eq!(profiles[5], "b_monitor_z_0");
        assert_eq!(profiles[6], "a_monitor_x_1");
        assert_eq!(profiles[17], "b_monitor_z_2");
        assert!(dir.path().join("machine.json").exists());
    }

    #[test]
    fn test_launch_all_stops_on_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let opts = RunOpts::new(dir.path()).unwrap();
        let a = Rc::new(FakeApp::new("a"));
        let apps: Vec<Rc<dyn AppConf>> = vec![a.clone()];
        let configs = fake_configs(&apps, &["x", "y"]);

        let mut runner = FakeRunner {
            fail_at: Some(2),
            ..Default::default()
        };
        let err = launch_all(&configs, 2, 0.0, &opts, &mut runner, &FakePlatformIo::new()).unwrap_err();
        println!("{:#}", &err);
        assert_eq!(runner.launches.len(), 3);
        assert_eq!(a.count("setup"), 3);
        assert_eq!(a.count("teardown"), 3);
        assert_eq!(a.count("experiment_teardown"), 1);
    }

    #[test]
    fn test_build_configs_monitor_and_unsupported() {
        let dir = tempfile::TempDir::new().unwrap();
        let app: Rc<dyn AppConf> = Rc::new(FakeApp::new("fake"));
        let mach = MachineRecord::default();
        let mut args = Args::default();

        args.mode = Mode::Monitor;
        let configs = build_configs(&args, &mach, &app, dir.path()).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "fake_monitor_default");

        args.mode = Mode::Analyze;
        assert!(build_configs(&args, &mach, &app, dir.path()).is_err());

        // frequency bounds need the machine record
        args.mode = Mode::Frequency;
        let err = build_configs(&args, &mach, &app, dir.path()).unwrap_err();
        assert!(err.downcast_ref::<ExpError>().is_some());
    }
}
