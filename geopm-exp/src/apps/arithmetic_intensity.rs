// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use regex::Regex;
use std::path::{Path, PathBuf};

use super::{apps_dir, resolve_exec, AppOpts};
use crate::app::{scan_fom, AppConf, FomPick};
use geopm_exp_intf::MachineRecord;
use geopm_util::*;

lazy_static::lazy_static! {
    static ref FOM_RE: Regex = Regex::new(r"(?m)^\s*FOM:\s*(\S+)").unwrap();
}

/// Microbenchmark whose regions `intensity_<N>` perform N floating
/// point operations per byte of memory traffic. The characterization
/// runs are built on its regions.
#[derive(Debug)]
pub struct ArithmeticIntensity {
    exec: PathBuf,
    rank_per_node: usize,
    args: Vec<String>,
}

impl ArithmeticIntensity {
    pub fn new(opts: &mut AppOpts, mach: &MachineRecord) -> Result<Self> {
        let dir = apps_dir(opts)?;
        let exec_name = opts
            .take_str("binary")
            .unwrap_or_else(|| "arithmetic_intensity".into());

        // Two cores are left for the controller and the OS.
        let rank_per_node = match opts.take::<usize>("ranks-per-node")? {
            Some(v) if v > 0 => v,
            Some(_) => config_bail!("arithmetic_intensity: ranks-per-node must be positive"),
            None => match mach.num_core() {
                Some(nr) if nr > 2 => nr - 2,
                Some(nr) => config_bail!("arithmetic_intensity: {} cores are not enough", nr),
                None => config_bail!(
                    "arithmetic_intensity: core count unknown, specify ranks-per-node"
                ),
            },
        };

        let mut args = vec![];
        if let Some(v) = opts.take::<f64>("slowdown")? {
            if v < 1.0 {
                config_bail!("arithmetic_intensity: slowdown must be at least 1.0, got {}", v);
            }
            args.push("--slowdown".into());
            args.push(format!("{}", v));
        }
        if let Some(v) = opts.take_str("benchmark-name") {
            args.push("--benchmark-name".into());
            args.push(v);
        }
        if let Some(v) = opts.take_str("args") {
            args.extend(v.split_whitespace().map(|x| x.to_string()));
        }

        Ok(Self {
            exec: resolve_exec(&dir, &exec_name),
            rank_per_node,
            args,
        })
    }
}

impl AppConf for ArithmeticIntensity {
    fn name(&self) -> &str {
        "arithmetic_intensity"
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
        self.args.clone()
    }

    fn setup_text(&self) -> String {
        "ulimit -s unlimited\n".into()
    }

    fn parse_fom(&self, log_path: &Path) -> Option<f64> {
        scan_fom(log_path, &FOM_RE, FomPick::Last)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_machine;
    use super::*;
    use std::fs;

    #[test]
    fn test_layout_and_args() {
        for (input, rpn, args) in &[
            ("", 38, vec![]),
            ("ranks-per-node=8,slowdown=2.5", 8, vec!["--slowdown", "2.5"]),
            (
                "benchmark-name=sse,args=--iterations 4",
                38,
                vec!["--benchmark-name", "sse", "--iterations", "4"],
            ),
        ] {
            let props = geopm_exp_intf::Args::parse_propset(input);
            let mut opts = AppOpts::new("arithmetic_intensity", &props);
            let app = ArithmeticIntensity::new(&mut opts, &test_machine()).unwrap();
            opts.finish().unwrap();
            println!("{:?} -> {} {:?}", input, app.rank_per_node(), app.exec_args());
            assert_eq!(app.rank_per_node(), *rpn);
            assert_eq!(app.exec_args(), *args);
        }
    }

    #[test]
    fn test_unknown_core_count() {
        let props = Default::default();
        let mut opts = AppOpts::new("arithmetic_intensity", &props);
        let err = ArithmeticIntensity::new(&mut opts, &MachineRecord::default()).unwrap_err();
        assert!(err.downcast_ref::<ExpError>().is_some());
    }

    #[test]
    fn test_parse_fom() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("ai.log");
        fs::write(&log, "intensity_1 done\nFOM: 101.5\nintensity_16 done\nFOM: 99.25\n").unwrap();
        let props = Default::default();
        let mut opts = AppOpts::new("arithmetic_intensity", &props);
        let app = ArithmeticIntensity::new(&mut opts, &test_machine()).unwrap();
        assert_eq!(app.parse_fom(&log), Some(99.25));
        assert_eq!(app.parse_fom(&dir.path().join("none.log")), None);
    }
}
