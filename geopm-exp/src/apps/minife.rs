// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use regex::Regex;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use super::{apps_dir, resolve_exec, shell_quote, stage_run_dir, AppOpts};
use crate::app::{scan_fom, AppConf, FomPick};
use geopm_exp_intf::MachineRecord;
use geopm_util::*;

lazy_static::lazy_static! {
    static ref FOM_RE: Regex = Regex::new(r"Total CG Mflops:\s*(\S+)").unwrap();
}

const DFL_DIM: f64 = 264.0;

#[derive(Debug)]
pub struct MiniFe {
    exec: PathBuf,
    rank_per_node: usize,
    dims: (usize, usize, usize),
    run_dir: RefCell<Option<PathBuf>>,
}

impl MiniFe {
    /// The default problem is weak scaled with the node count.
    pub fn new(opts: &mut AppOpts, mach: &MachineRecord, node_count: usize) -> Result<Self> {
        let dir = apps_dir(opts)?;
        if node_count == 0 {
            config_bail!("minife: node count must be positive");
        }

        let rank_per_node = match opts.take::<usize>("ranks-per-node")? {
            Some(v) if v > 0 => v,
            Some(_) => config_bail!("minife: ranks-per-node must be positive"),
            None => match mach.num_core() {
                Some(nr) if nr > 1 => nr - 1,
                _ => config_bail!("minife: core count unknown, specify ranks-per-node"),
            },
        };

        let dfl_dim = (DFL_DIM * (node_count as f64).cbrt()).round() as usize;
        let nx = opts.take::<usize>("nx")?.unwrap_or(dfl_dim);
        let ny = opts.take::<usize>("ny")?.unwrap_or(nx);
        let nz = opts.take::<usize>("nz")?.unwrap_or(nx);

        Ok(Self {
            exec: resolve_exec(&dir, "miniFE.x"),
            rank_per_node,
            dims: (nx, ny, nz),
            run_dir: RefCell::new(None),
        })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }
}

impl AppConf for MiniFe {
    fn name(&self) -> &str {
        "minife"
    }

    fn rank_per_node(&self) -> usize {
        self.rank_per_node
    }

    fn cpu_per_rank(&self) -> Option<usize> {
        Some(1)
    }

    fn exec_path(&self) -> PathBuf {
        self.exec.clone()
    }

    fn exec_args(&self) -> Vec<String> {
        vec![
            format!("-nx={}", self.dims.0),
            format!("-ny={}", self.dims.1),
            format!("-nz={}", self.dims.2),
        ]
    }

    fn setup_text(&self) -> String {
        match self.run_dir.borrow().as_ref() {
            Some(dir) => format!("cd {}\n", shell_quote(&dir.to_string_lossy())),
            None => String::new(),
        }
    }

    fn trial_setup(&self, run_id: &str, output_dir: &Path) -> Result<()> {
        self.run_dir.replace(Some(stage_run_dir(run_id, output_dir)?));
        Ok(())
    }

    fn trial_teardown(&self, _run_id: &str, _output_dir: &Path) -> Result<()> {
        self.run_dir.replace(None);
        Ok(())
    }

    /// miniFE writes its summary into `miniFE.*.yaml` in the cwd. Older
    /// builds echo it to stdout, so the log is the fallback.
    fn parse_fom(&self, log_path: &Path) -> Option<f64> {
        if let Some(dir) = self.run_dir.borrow().as_ref() {
            let pattern = dir.join("miniFE.*.yaml");
            if let Ok(paths) = glob::glob(&pattern.to_string_lossy()) {
                let mut yamls: Vec<PathBuf> = paths.filter_map(|x| x.ok()).collect();
                yamls.sort();
                if let Some(fom) = yamls.last().and_then(|p| scan_fom(p, &FOM_RE, FomPick::Last)) {
                    return Some(fom);
                }
            }
        }
        scan_fom(log_path, &FOM_RE, FomPick::Last)
    }
}
