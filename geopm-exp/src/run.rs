// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::app::{AppConf, Controller, LaunchConfig};
use super::apps::shell_quote;
use geopm_launch::{geopm_opt_takes_value, LaunchOverrides};
use geopm_util::*;

/// Flags whose values are merged instead of replaced when repeated.
const UNION_FLAGS: &[&str] = &["--geopm-report-signals", "--geopm-trace-signals"];

/// Runs a launcher command line. `argv[0]` is the program name the way
/// geopm_launch::factory() expects it.
pub trait CommandRunner {
    fn run(
        &mut self,
        argv: &[String],
        ovr: &LaunchOverrides,
        cwd: &Path,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<()>;
}

/// Launches through the resource manager detected on this system.
pub struct GeopmLaunchRunner;

impl CommandRunner for GeopmLaunchRunner {
    fn run(
        &mut self,
        argv: &[String],
        ovr: &LaunchOverrides,
        cwd: &Path,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<()> {
        let mut launcher = geopm_launch::factory(argv, None, ovr.clone())?;
        launcher.set_cwd(cwd);
        launcher.run(stdout, stderr)
    }
}

/// Settings shared by every run of an experiment.
#[derive(Debug, Clone)]
pub struct RunOpts {
    pub output_dir: PathBuf,
    pub node_count: usize,
    pub extra_args: Vec<String>,
    pub enable_traces: bool,
    pub enable_profile_traces: bool,
    pub init_control: Option<PathBuf>,
    pub exec_wrapper: Vec<String>,
    pub geopm_version: String,
}

impl RunOpts {
    /// Create `output_dir` if needed. All artifact paths derived from it
    /// are absolute as the launcher runs with `output_dir` as its cwd.
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        let dir = output_dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Creating {:?}", dir))?;
        let output_dir = dir
            .canonicalize()
            .with_context(|| format!("Resolving {:?}", dir))?;
        Ok(Self {
            output_dir,
            node_count: 1,
            extra_args: vec![],
            enable_traces: false,
            enable_profile_traces: false,
            init_control: None,
            exec_wrapper: vec![],
            geopm_version: "unknown".into(),
        })
    }
}

/// Artifact paths of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPaths {
    pub report: PathBuf,
    pub trace: PathBuf,
    pub profile_trace: PathBuf,
    pub log: PathBuf,
    pub script: PathBuf,
}

impl RunPaths {
    pub fn new(output_dir: &Path, run_id: &str, app_name: &str) -> Self {
        Self {
            report: output_dir.join(format!("{}.report", run_id)),
            trace: output_dir.join(format!("{}.trace", run_id)),
            profile_trace: output_dir.join(format!("{}.ptrace", run_id)),
            log: output_dir.join(format!("{}.log", run_id)),
            script: output_dir.join(format!("{}.sh", app_name)),
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

enum FlagEnt {
    Plain(String),
    Geopm(String, Option<String>),
}

/// Collapse repeated `--geopm-*` options. Report and trace signal lists
/// are merged in order, anything else is last-wins. Both `--flag=val`
/// and `--flag val` are accepted and the result always uses the former.
/// Other arguments are left alone in their original positions.
pub fn merge_geopm_flags(args: &[String]) -> Vec<String> {
    let mut ents: Vec<FlagEnt> = vec![];
    let mut index = BTreeMap::<String, usize>::new();

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        i += 1;

        let (name, inline_val) = match arg.find('=') {
            Some(pos) if arg.starts_with("--geopm-") => (&arg[..pos], Some(arg[pos + 1..].to_string())),
            _ => (arg.as_str(), None),
        };
        let takes_value = match geopm_opt_takes_value(name) {
            Some(v) => v,
            None => {
                ents.push(FlagEnt::Plain(arg.clone()));
                continue;
            }
        };
        let val = match (takes_value, inline_val) {
            (true, Some(v)) => Some(v),
            (true, None) if i < args.len() => {
                i += 1;
                Some(args[i - 1].clone())
            }
            (_, v) => v,
        };

        match index.get(name) {
            None => {
                index.insert(name.to_string(), ents.len());
                ents.push(FlagEnt::Geopm(name.to_string(), val));
            }
            Some(&idx) => {
                if let FlagEnt::Geopm(_, old) = &mut ents[idx] {
                    if UNION_FLAGS.contains(&name) {
                        let mut sigs: Vec<String> = vec![];
                        for sig in old.iter().chain(val.iter()).flat_map(|v| v.split(',')) {
                            if sig.len() > 0 && !sigs.iter().any(|x| x == sig) {
                                sigs.push(sig.to_string());
                            }
                        }
                        *old = Some(sigs.join(","));
                    } else if *old != val {
                        warn!(
                            "run: {} given more than once, using {:?} over {:?}",
                            name, &val, &old
                        );
                        *old = val;
                    }
                }
            }
        }
    }

    ents.into_iter()
        .map(|ent| match ent {
            FlagEnt::Plain(v) => v,
            FlagEnt::Geopm(name, Some(val)) => format!("{}={}", name, val),
            FlagEnt::Geopm(name, None) => name,
        })
        .collect()
}

/// GEOPM flags for one run, before merging.
pub fn geopm_flags(config: &LaunchConfig, run_id: &str, paths: &RunPaths, opts: &RunOpts) -> Vec<String> {
    let mut flags = vec![];

    if config.controller == Controller::Disabled {
        flags.push("--geopm-ctl-disable".to_string());
    } else {
        if let Some(agent) = config.agent.as_ref().filter(|a| !a.is_monitor()) {
            flags.push(format!("--geopm-agent={}", agent.agent()));
            flags.push(format!("--geopm-policy={}", path_str(agent.path())));
        }
        flags.push(format!("--geopm-report={}", path_str(&paths.report)));
        flags.push(format!("--geopm-profile={}", run_id));
        if opts.enable_traces {
            flags.push(format!("--geopm-trace={}", path_str(&paths.trace)));
        }
        if opts.enable_profile_traces {
            flags.push(format!("--geopm-trace-profile={}", path_str(&paths.profile_trace)));
        }
        if config.controller == Controller::Application {
            flags.push("--geopm-ctl=application".to_string());
        }
        if let Some(path) = opts.init_control.as_ref() {
            flags.push(format!("--geopm-init-control={}", path_str(path)));
        }
        flags.extend(config.app.extra_launcher_flags());
    }
    flags.extend(opts.extra_args.iter().cloned());
    merge_geopm_flags(&flags)
}

/// Header written for runs without the controller so that every report
/// parses the same way.
pub fn disabled_report_header(version: &str, run_id: &str) -> String {
    format!(
        "##### geopm {} #####\nStart Time: {}\nProfile: {}\nAgent: None\nPolicy: None\n",
        version,
        format_unix_time(unix_now()),
        run_id
    )
}

fn push_text(script: &mut String, text: &str) {
    script.push_str(text);
    if !text.is_empty() && !text.ends_with('\n') {
        script.push('\n');
    }
}

/// Shell script run on the compute nodes: setup text, the application
/// and cleanup text. The application's exit code is preserved.
pub fn app_script(app: &dyn AppConf, exec_wrapper: &[String]) -> String {
    let mut cmd: Vec<String> = exec_wrapper.iter().map(|x| shell_quote(x)).collect();
    cmd.push(shell_quote(&path_str(&app.exec_path())));
    cmd.extend(app.exec_args().iter().map(|x| shell_quote(x)));

    let mut script = String::from("#!/bin/bash\n");
    push_text(&mut script, &app.setup_text());
    push_text(&mut script, &cmd.join(" "));
    script.push_str("rc=$?\n");
    push_text(&mut script, &app.cleanup_text());
    script.push_str("exit $rc\n");
    script
}

fn append_trailer(report: &Path, fom: Option<f64>, runtime: f64) -> Result<()> {
    let mut trailer = String::new();
    match fs::read_to_string(report) {
        Ok(body) if body.len() > 0 && !body.ends_with('\n') => trailer.push('\n'),
        Ok(_) => {}
        Err(e) => warn!("run: Report {:?} unreadable ({}), creating", report, &e),
    }
    let fom = match fom {
        Some(v) => format!("{}", v),
        None => String::new(),
    };
    trailer += &format!("Figure of Merit: {}\nTotal Runtime: {}\n", fom, runtime);

    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(report)
        .with_context(|| format!("Opening {:?}", report))?;
    f.write_all(trailer.as_bytes())
        .with_context(|| format!("Appending to {:?}", report))?;
    Ok(())
}

/// Undoes the adapter's per-trial setup on every exit path.
struct TrialGuard<'a> {
    app: &'a dyn AppConf,
    run_id: &'a str,
    output_dir: &'a Path,
}

impl<'a> Drop for TrialGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.app.trial_teardown(self.run_id, self.output_dir) {
            warn!("run: Teardown of {} failed ({:#})", self.run_id, &e);
        }
    }
}

/// Run one trial of `config` and append the figure of merit and the
/// runtime to its report.
pub fn run_one(
    runner: &mut dyn CommandRunner,
    config: &LaunchConfig,
    run_id: &str,
    opts: &RunOpts,
) -> Result<()> {
    let app = &*config.app;
    let paths = RunPaths::new(&opts.output_dir, run_id, app.name());
    info!("run: Starting {}", run_id);

    if config.controller != Controller::Disabled {
        if let Some(agent) = config.agent.as_ref() {
            agent.write()?;
        }
    }
    let flags = geopm_flags(config, run_id, &paths, opts);
    if config.controller == Controller::Disabled {
        fs::write(&paths.report, disabled_report_header(&opts.geopm_version, run_id))
            .with_context(|| format!("Writing {:?}", &paths.report))?;
    }

    app.trial_setup(run_id, &opts.output_dir)?;
    let _guard = TrialGuard {
        app,
        run_id,
        output_dir: &opts.output_dir,
    };

    fs::write(&paths.script, app_script(app, &opts.exec_wrapper))
        .with_context(|| format!("Writing {:?}", &paths.script))?;
    set_executable(&paths.script)?;

    let mut argv = vec!["geopm-exp".to_string()];
    argv.extend(flags);
    argv.push("--".into());
    argv.push(path_str(&paths.script));

    let ovr = LaunchOverrides {
        num_node: Some(opts.node_count),
        num_rank: Some(app.rank_per_node() * opts.node_count),
        cpu_per_rank: app.cpu_per_rank(),
        ..Default::default()
    };

    let mut log_out = fs::File::create(&paths.log)
        .with_context(|| format!("Creating {:?}", &paths.log))?;
    let mut log_err = log_out.try_clone()?;

    let started_at = Instant::now();
    runner.run(&argv, &ovr, &opts.output_dir, &mut log_out, &mut log_err)?;
    let runtime = started_at.elapsed().as_secs_f64();
    log_out.flush()?;
    drop(log_out);
    drop(log_err);

    let fom = app.parse_fom(&paths.log);
    if fom.is_none() {
        warn!("run: No figure of merit for {}", run_id);
    }
    append_trailer(&paths.report, fom, runtime)?;
    info!("run: Finished {} in {}", run_id, format_duration(runtime));
    Ok(())
}
