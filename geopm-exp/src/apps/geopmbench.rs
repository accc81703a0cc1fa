// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use super::{apps_dir, remove_logged, resolve_exec, AppOpts};
use crate::app::AppConf;
use geopm_exp_intf::MachineRecord;
use geopm_util::*;

/// Region mix handed to geopmbench through a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConf {
    #[serde(rename = "loop-count")]
    pub loop_count: u64,
    pub region: Vec<String>,
    #[serde(rename = "big-o")]
    pub big_o: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hostname: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub imbalance: Option<Vec<f64>>,
}

impl Default for BenchConf {
    fn default() -> Self {
        Self {
            loop_count: 10,
            region: vec!["dgemm".into(), "stream".into(), "all2all".into()],
            big_o: vec![8.0, 0.2, 1.0],
            hostname: None,
            imbalance: None,
        }
    }
}

impl JsonLoad for BenchConf {}
impl JsonSave for BenchConf {}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(':')
        .map(|x| x.trim())
        .filter(|x| x.len() > 0)
        .map(|x| x.to_string())
        .collect()
}

fn parse_list_f64(input: &str, what: &str) -> Result<Vec<f64>> {
    let mut vals = vec![];
    for tok in split_list(input) {
        match tok.parse::<f64>() {
            Ok(v) => vals.push(v),
            Err(_) => config_bail!("geopmbench: invalid {} value {:?}", what, &tok),
        }
    }
    Ok(vals)
}

#[derive(Debug)]
pub struct GeopmBench {
    exec: PathBuf,
    rank_per_node: usize,
    bench_conf: BenchConf,
    conf_path: RefCell<Option<PathBuf>>,
}

impl GeopmBench {
    /// Lists in `region`, `big-o`, `hostname` and `imbalance` are ':'
    /// separated as ',' separates the options themselves.
    pub fn new(opts: &mut AppOpts, mach: &MachineRecord) -> Result<Self> {
        let dir = apps_dir(opts)?;
        let mut bench_conf = BenchConf::default();

        if let Some(v) = opts.take::<u64>("loop-count")? {
            bench_conf.loop_count = v;
        }
        if let Some(v) = opts.take_str("region") {
            bench_conf.region = split_list(&v);
        }
        if let Some(v) = opts.take_str("big-o") {
            bench_conf.big_o = parse_list_f64(&v, "big-o")?;
        }
        if let Some(v) = opts.take_str("hostname") {
            bench_conf.hostname = Some(split_list(&v));
        }
        if let Some(v) = opts.take_str("imbalance") {
            bench_conf.imbalance = Some(parse_list_f64(&v, "imbalance")?);
        }
        if bench_conf.region.len() != bench_conf.big_o.len() {
            config_bail!(
                "geopmbench: {} regions but {} big-o values",
                bench_conf.region.len(),
                bench_conf.big_o.len()
            );
        }
        if let (Some(hosts), Some(imbs)) = (&bench_conf.hostname, &bench_conf.imbalance) {
            if hosts.len() != imbs.len() {
                config_bail!("geopmbench: hostname and imbalance lists differ in length");
            }
        }

        let rank_per_node = match opts.take::<usize>("ranks-per-node")? {
            Some(v) if v > 0 => v,
            Some(_) => config_bail!("geopmbench: ranks-per-node must be positive"),
            None => mach.num_package().filter(|v| *v > 0).unwrap_or(1),
        };

        Ok(Self {
            exec: resolve_exec(&dir, "geopmbench"),
            rank_per_node,
            bench_conf,
            conf_path: RefCell::new(None),
        })
    }

    pub fn bench_conf(&self) -> &BenchConf {
        &self.bench_conf
    }
}

impl AppConf for GeopmBench {
    fn name(&self) -> &str {
        "geopmbench"
    }

    fn rank_per_node(&self) -> usize {
        self.rank_per_node
    }

    fn exec_path(&self) -> PathBuf {
        self.exec.clone()
    }

    fn exec_args(&self) -> Vec<String> {
        match self.conf_path.borrow().as_ref() {
            Some(path) => vec![path.to_string_lossy().into_owned()],
            None => vec![],
        }
    }

    fn trial_setup(&self, run_id: &str, output_dir: &Path) -> Result<()> {
        let path = output_dir.join(format!("{}_bench.json", run_id));
        self.bench_conf.save(&path)?;
        self.conf_path.replace(Some(path));
        Ok(())
    }

    fn trial_teardown(&self, _run_id: &str, _output_dir: &Path) -> Result<()> {
        if let Some(path) = self.conf_path.borrow_mut().take() {
            remove_logged(&path);
        }
        Ok(())
    }

    fn parse_fom(&self, _log_path: &Path) -> Option<f64> {
        None
    }
}
