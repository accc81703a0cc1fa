// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{exit, Command};

use geopm_exp_intf::{parse_init_control, Args, Mode};
use geopm_util::*;

mod analyze;
mod app;
mod apps;
mod characterize;
mod machine;
mod report;
mod run;
mod sweep;
mod trace;

use app::LaunchConfig;
use machine::GeopmRead;
use run::{GeopmLaunchRunner, RunOpts};

const ENV_OVERRIDE_PATH: &str = "/etc/geopm/environment-override.json";
const ENV_DEFAULT_PATH: &str = "/etc/geopm/environment-default.json";

/// `GEOPM_POLICY` of a system environment file if it has one.
fn system_policy(path: &Path) -> Option<String> {
    let body = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(val) => val.get("GEOPM_POLICY")?.as_str().map(|x| x.to_string()),
        Err(e) => {
            warn!("Failed to parse {:?} ({})", path, &e);
            None
        }
    }
}

/// GEOPM ignores the policy we hand it when the system environment
/// files both pin one elsewhere.
fn check_env_conflict(override_path: &Path, default_path: &Path, configs: &[LaunchConfig]) -> Result<()> {
    let pinned: Vec<String> = [override_path, default_path]
        .iter()
        .filter_map(|p| system_policy(p))
        .collect();
    if pinned.len() < 2 {
        return Ok(());
    }
    for config in configs.iter() {
        let agent = match config.agent.as_ref() {
            Some(v) if !v.is_monitor() => v,
            _ => continue,
        };
        if pinned.iter().all(|p| Path::new(p) != agent.path()) {
            config_bail!(
                "system GEOPM environment pins GEOPM_POLICY to {:?} which conflicts with {:?}",
                &pinned[0],
                agent.path()
            );
        }
    }
    Ok(())
}

fn geopm_version() -> String {
    match command_output(Command::new("geopmread").arg("--version")) {
        Ok(out) => out.lines().next().unwrap_or("unknown").trim().to_string(),
        Err(e) => {
            warn!("Failed to determine the geopm version ({:#})", &e);
            "unknown".into()
        }
    }
}

fn run_opts(args: &Args) -> Result<RunOpts> {
    let mut opts = RunOpts::new(&args.output_dir)?;
    opts.node_count = args.node_count;
    opts.extra_args = args.extra_args.clone();
    opts.enable_traces = args.enable_traces;
    opts.enable_profile_traces = args.enable_profile_traces;
    if let Some(path) = args.init_control.as_ref() {
        let path = PathBuf::from(path)
            .canonicalize()
            .with_context(|| format!("Resolving --init-control {:?}", path))?;
        let body = fs::read_to_string(&path).with_context(|| format!("Reading {:?}", &path))?;
        parse_init_control(&body)?;
        opts.init_control = Some(path);
    }
    if let Ok(wrapper) = env::var("GEOPM_EXEC_WRAPPER") {
        opts.exec_wrapper = wrapper.split_whitespace().map(|x| x.to_string()).collect();
    }
    opts.geopm_version = geopm_version();
    Ok(opts)
}

fn run(args: &Args) -> Result<()> {
    if args.mode == Mode::Analyze {
        print!("{}", analyze::analyze(&args.report_glob, Path::new(&args.output_dir))?);
        return Ok(());
    }

    let opts = run_opts(args)?;
    let pio = GeopmRead;
    let mach = machine::init(&opts.output_dir, &pio)?;
    let app = apps::create_app(args, &mach)?;
    let mut runner = GeopmLaunchRunner;

    match args.mode {
        Mode::CharacterizeCpu => {
            characterize::characterize_cpu(args, &mach, &app, &opts, &mut runner, &pio)?;
        }
        Mode::CharacterizeGpu => {
            characterize::characterize_gpu(args, &mach, &app, &opts, &mut runner, &pio)?;
        }
        _ => {
            let configs = sweep::build_configs(args, &mach, &app, &opts.output_dir)?;
            check_env_conflict(Path::new(ENV_OVERRIDE_PATH), Path::new(ENV_DEFAULT_PATH), &configs)?;
            info!(
                "{:?} sweep of {}: {} configurations x {} trials",
                args.mode,
                app.name(),
                configs.len(),
                args.trial_count
            );
            sweep::launch_all(&configs, args.trial_count, args.cool_off_time, &opts, &mut runner, &pio)?;
        }
    }
    Ok(())
}

fn main() {
    setup_prog_state();

    let args_file = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("Failed to process args ({:#})", &e);
        exit(1);
    });

    if let Err(e) = run(&args_file.data) {
        error!("{:#}", &e);
        exit(1);
    }
}
