// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use log::warn;
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use geopm_exp_intf::AgentConf;

/// Adapts a benchmark binary to the launch contract. Hooks default to
/// no-ops. `exec_args()` is only read after `trial_setup()`.
pub trait AppConf {
    fn name(&self) -> &str;
    fn rank_per_node(&self) -> usize;

    /// None lets the launcher decide.
    fn cpu_per_rank(&self) -> Option<usize> {
        None
    }

    fn exec_path(&self) -> PathBuf;
    fn exec_args(&self) -> Vec<String>;

    fn extra_launcher_flags(&self) -> Vec<String> {
        vec![]
    }

    /// Shell lines run on the compute node before the application.
    fn setup_text(&self) -> String {
        String::new()
    }

    /// Shell lines run on the compute node after the application.
    fn cleanup_text(&self) -> String {
        String::new()
    }

    fn trial_setup(&self, _run_id: &str, _output_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn trial_teardown(&self, _run_id: &str, _output_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn experiment_teardown(&self, _output_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Never fails. A missing or empty log yields None.
    fn parse_fom(&self, log_path: &Path) -> Option<f64>;
}

/// Which of several matching figure of merit lines to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FomPick {
    First,
    Last,
}

/// Scan `path` for `re` and parse the first capture group of the picked
/// match.
pub fn scan_fom(path: &Path, re: &Regex, pick: FomPick) -> Option<f64> {
    let body = match fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) => {
            warn!("fom: Failed to read {:?} ({})", path, &e);
            return None;
        }
    };
    let mut caps = re
        .captures_iter(&body)
        .filter_map(|cap| cap.get(1).and_then(|m| m.as_str().trim().parse::<f64>().ok()))
        .filter(|v| v.is_finite());
    match pick {
        FomPick::First => caps.next(),
        FomPick::Last => caps.last(),
    }
}

/// Where the GEOPM controller runs for a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    /// Extra rank per node, or a thread, depending on `--geopm-ctl`.
    InProcess,
    /// A separate `geopmctl` job next to the application.
    Application,
    Disabled,
}

/// One point of a sweep.
#[derive(Clone)]
pub struct LaunchConfig {
    pub app: Rc<dyn AppConf>,
    pub agent: Option<AgentConf>,
    pub name: String,
    pub controller: Controller,
}

impl LaunchConfig {
    pub fn new(app: Rc<dyn AppConf>, agent: Option<AgentConf>, variant: &str) -> Self {
        let name = Self::config_name(app.name(), agent.as_ref(), variant);
        Self {
            app,
            agent,
            name,
            controller: Controller::InProcess,
        }
    }

    pub fn config_name(app_name: &str, agent: Option<&AgentConf>, variant: &str) -> String {
        let agent_name = match agent {
            Some(agent) => agent.agent(),
            None => "no_ctl",
        };
        format!("{}_{}_{}", app_name, agent_name, variant)
    }

    pub fn with_controller(mut self, controller: Controller) -> Self {
        self.controller = controller;
        self
    }

    pub fn run_id(&self, iteration: usize) -> String {
        format!("{}_{}", &self.name, iteration)
    }
}

impl fmt::Debug for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchConfig")
            .field("app", &self.app.name())
            .field("agent", &self.agent)
            .field("name", &self.name)
            .field("controller", &self.controller)
            .finish()
    }
}
