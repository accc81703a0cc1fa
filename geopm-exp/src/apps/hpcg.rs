// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result};
use log::warn;
use regex::Regex;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use super::{apps_dir, resolve_exec, shell_quote, stage_run_dir, AppOpts};
use crate::app::{scan_fom, AppConf, FomPick};
use geopm_exp_intf::MachineRecord;
use geopm_util::*;

lazy_static::lazy_static! {
    static ref FOM_RE: Regex = Regex::new(r"GFLOP/s rating of[=:]\s*([0-9.eE+-]+)").unwrap();
}

#[derive(Debug)]
pub struct Hpcg {
    exec: PathBuf,
    rank_per_node: usize,
    cpu_per_rank: usize,
    dims: (usize, usize, usize),
    runtime: usize,
    run_dir: RefCell<Option<PathBuf>>,
}

impl Hpcg {
    pub fn new(opts: &mut AppOpts, mach: &MachineRecord) -> Result<Self> {
        let dir = apps_dir(opts)?;

        let rank_per_node = match opts.take::<usize>("ranks-per-node")? {
            Some(v) => v,
            None => match mach.num_package() {
                Some(v) => v,
                None => config_bail!("hpcg: package count unknown, specify ranks-per-node"),
            },
        };
        let cpu_per_rank = match opts.take::<usize>("cpu-per-rank")? {
            Some(v) => v,
            None => match mach.num_core() {
                Some(nr) => nr / rank_per_node.max(1),
                None => config_bail!("hpcg: core count unknown, specify cpu-per-rank"),
            },
        };
        if rank_per_node == 0 || cpu_per_rank == 0 {
            config_bail!("hpcg: ranks-per-node and cpu-per-rank must be positive");
        }

        let nx = opts.take::<usize>("nx")?.unwrap_or(104);
        let ny = opts.take::<usize>("ny")?.unwrap_or(nx);
        let nz = opts.take::<usize>("nz")?.unwrap_or(nx);
        for dim in &[nx, ny, nz] {
            if *dim < 16 || *dim % 8 != 0 {
                config_bail!("hpcg: local dimensions must be multiples of 8 and >= 16, got {}", dim);
            }
        }
        let runtime = opts.take::<usize>("runtime")?.unwrap_or(60);

        Ok(Self {
            exec: resolve_exec(&dir, "xhpcg"),
            rank_per_node,
            cpu_per_rank,
            dims: (nx, ny, nz),
            runtime,
            run_dir: RefCell::new(None),
        })
    }

    fn hpcg_dat(&self) -> String {
        format!(
            "HPCG benchmark input file\nSandia National Laboratories; University of Tennessee, Knoxville\n{} {} {}\n{}\n",
            self.dims.0, self.dims.1, self.dims.2, self.runtime
        )
    }
}

impl AppConf for Hpcg {
    fn name(&self) -> &str {
        "hpcg"
    }

    fn rank_per_node(&self) -> usize {
        self.rank_per_node
    }

    fn cpu_per_rank(&self) -> Option<usize> {
        Some(self.cpu_per_rank)
    }

    fn exec_path(&self) -> PathBuf {
        self.exec.clone()
    }

    fn exec_args(&self) -> Vec<String> {
        vec![]
    }

    // xhpcg reads hpcg.dat from and writes its results into the cwd
    fn setup_text(&self) -> String {
        match self.run_dir.borrow().as_ref() {
            Some(dir) => format!("cd {}\n", shell_quote(&dir.to_string_lossy())),
            None => String::new(),
        }
    }

    fn trial_setup(&self, run_id: &str, output_dir: &Path) -> Result<()> {
        let dir = stage_run_dir(run_id, output_dir)?;
        let dat = dir.join("hpcg.dat");
        fs::write(&dat, self.hpcg_dat()).with_context(|| format!("Writing {:?}", &dat))?;
        self.run_dir.replace(Some(dir));
        Ok(())
    }

    fn trial_teardown(&self, _run_id: &str, _output_dir: &Path) -> Result<()> {
        self.run_dir.replace(None);
        Ok(())
    }

    fn parse_fom(&self, _log_path: &Path) -> Option<f64> {
        let dir = self.run_dir.borrow().clone()?;
        let pattern = dir.join("HPCG-Benchmark*.txt");
        let mut results: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths.filter_map(|x| x.ok()).collect(),
            Err(e) => {
                warn!("hpcg: Invalid result pattern {:?} ({})", &pattern, &e);
                return None;
            }
        };
        results.sort();
        match results.last() {
            Some(path) => scan_fom(path, &FOM_RE, FomPick::Last),
            None => {
                warn!("hpcg: No HPCG-Benchmark result in {:?}", &dir);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_machine;
    use super::*;

    #[test]
    fn test_stage_and_parse() {
        let dir = tempfile::TempDir::new().unwrap();
        let props = geopm_exp_intf::Args::parse_propset("nx=32,runtime=30");
        let mut opts = AppOpts::new("hpcg", &props);
        let app = Hpcg::new(&mut opts, &test_machine()).unwrap();
        opts.finish().unwrap();
        assert_eq!((app.rank_per_node(), app.cpu_per_rank()), (2, Some(20)));
        assert_eq!(app.parse_fom(&dir.path().join("x.log")), None);

        app.trial_setup("hpcg_monitor_default_0", dir.path()).unwrap();
        let run_dir = dir.path().join("hpcg_monitor_default_0");
        let dat = fs::read_to_string(run_dir.join("hpcg.dat")).unwrap();
        println!("{}", &dat);
        assert!(dat.ends_with("32 32 32\n30\n"));
        assert!(app.setup_text().starts_with("cd "));

        assert_eq!(app.parse_fom(&dir.path().join("x.log")), None);
        fs::write(
            run_dir.join("HPCG-Benchmark_3.1_2021-03-01_10-00-00.txt"),
            "Final Summary::HPCG result is VALID with a GFLOP/s rating of=37.25\n",
        )
        .unwrap();
        assert_eq!(app.parse_fom(&dir.path().join("x.log")), Some(37.25));

        app.trial_teardown("hpcg_monitor_default_0", dir.path()).unwrap();
        assert_eq!(app.setup_text(), "");
    }

    #[test]
    fn test_bad_dims() {
        for input in &["nx=12", "nx=32,nz=36", "ranks-per-node=0"] {
            let props = geopm_exp_intf::Args::parse_propset(input);
            let mut opts = AppOpts::new("hpcg", &props);
            assert!(Hpcg::new(&mut opts, &test_machine()).is_err(), "{}", input);
        }
    }
}
