// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use regex::Regex;
use std::path::{Path, PathBuf};

use super::{apps_dir, resolve_exec, run_hook_script, AppOpts};
use crate::app::{scan_fom, AppConf, FomPick};
use geopm_exp_intf::MachineRecord;
use geopm_util::*;

lazy_static::lazy_static! {
    static ref DGEMM_FOM_RE: Regex = Regex::new(r"AVG Rate \(MF/s\): (\S+)").unwrap();
    static ref NSTREAM_FOM_RE: Regex = Regex::new(r"Rate \(MB/s\): (\S+)").unwrap();
}

/// ParRes GPU kernels. Both only run on a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParresKernel {
    Dgemm,
    Nstream,
}

impl ParresKernel {
    fn name(&self) -> &'static str {
        match self {
            Self::Dgemm => "parres_dgemm",
            Self::Nstream => "parres_nstream",
        }
    }

    fn binary(&self) -> &'static str {
        match self {
            Self::Dgemm => "Kernels/Cxx11/dgemm-mpi-cublas",
            Self::Nstream => "Kernels/Cxx11/nstream-mpi-cuda",
        }
    }

    fn dfl_args(&self) -> &'static [&'static str] {
        match self {
            Self::Dgemm => &["10", "16000"],
            Self::Nstream => &["10", "1000000000"],
        }
    }

    fn fom_re(&self) -> &'static Regex {
        match self {
            Self::Dgemm => &DGEMM_FOM_RE,
            Self::Nstream => &NSTREAM_FOM_RE,
        }
    }
}

#[derive(Debug)]
pub struct Parres {
    kernel: ParresKernel,
    exec: PathBuf,
    args: Vec<String>,
    cores_per_node: usize,
    cores_per_rank: usize,
    exp_setup: Option<PathBuf>,
    teardown: Option<PathBuf>,
}

fn hook_path(opts: &mut AppOpts, key: &str, dir: &Path) -> Result<Option<PathBuf>> {
    let path = match opts.take_str(key) {
        Some(v) => PathBuf::from(v),
        None => return Ok(None),
    };
    if path.is_file() {
        return Ok(Some(path));
    }
    let rel = dir.join(&path);
    if rel.is_file() {
        return Ok(Some(rel));
    }
    config_bail!("parres: {} file {:?} not found", key, &path)
}

impl Parres {
    pub fn new(
        kernel: ParresKernel,
        opts: &mut AppOpts,
        mach: &MachineRecord,
        node_count: usize,
    ) -> Result<Self> {
        let dir = apps_dir(opts)?;
        let num_gpu = mach.num_gpu();

        if node_count != 1 {
            config_bail!("{} only runs on 1 node, not {}", kernel.name(), node_count);
        }

        let cores_per_rank = opts.take::<usize>("cores-per-rank")?.unwrap_or(1);
        if cores_per_rank == 0 {
            config_bail!("{}: cores-per-rank must be positive", kernel.name());
        }
        let cores_per_node = opts.take::<usize>("cores-per-node")?;
        let gpus_per_node = opts.take::<usize>("gpus-per-node")?;

        let (cores_per_node, gpus_per_node) = match kernel {
            ParresKernel::Dgemm => {
                let cores = cores_per_node.unwrap_or(4);
                if let Some(nr_core) = mach.num_core() {
                    if cores > nr_core {
                        config_bail!(
                            "{}: {} cores requested, only {} available",
                            kernel.name(),
                            cores,
                            nr_core
                        );
                    }
                }
                let gpus = gpus_per_node.unwrap_or(num_gpu);
                if gpus != num_gpu {
                    config_bail!(
                        "{}: gpus-per-node must match the {} available GPUs",
                        kernel.name(),
                        num_gpu
                    );
                }
                (cores, gpus)
            }
            ParresKernel::Nstream => {
                let cores = cores_per_node.unwrap_or(1);
                if cores != 1 {
                    config_bail!("{}: only 1 core per node is supported", kernel.name());
                }
                let gpus = gpus_per_node.unwrap_or(1);
                if gpus > num_gpu {
                    config_bail!(
                        "{}: {} GPUs requested, only {} available",
                        kernel.name(),
                        gpus,
                        num_gpu
                    );
                }
                (cores, gpus)
            }
        };

        if cores_per_node % cores_per_rank != 0 {
            config_bail!(
                "{}: {} cores per node not divisible by {} cores per rank",
                kernel.name(),
                cores_per_node,
                cores_per_rank
            );
        }
        if cores_per_node / cores_per_rank != gpus_per_node {
            config_bail!(
                "{}: ranks per node ({}) must equal GPUs per node ({})",
                kernel.name(),
                cores_per_node / cores_per_rank,
                gpus_per_node
            );
        }

        if let Some(init) = hook_path(opts, "init-setup", &dir)? {
            run_hook_script(&init)?;
        }
        let exp_setup = hook_path(opts, "exp-setup", &dir)?;
        let teardown = hook_path(opts, "teardown", &dir)?;

        let args = match opts.take_str("args") {
            Some(v) => v.split_whitespace().map(|x| x.to_string()).collect(),
            None => kernel.dfl_args().iter().map(|x| x.to_string()).collect(),
        };

        Ok(Self {
            kernel,
            exec: resolve_exec(&dir, kernel.binary()),
            args,
            cores_per_node,
            cores_per_rank,
            exp_setup,
            teardown,
        })
    }
}

impl AppConf for Parres {
    fn name(&self) -> &str {
        self.kernel.name()
    }

    fn rank_per_node(&self) -> usize {
        self.cores_per_node / self.cores_per_rank
    }

    fn cpu_per_rank(&self) -> Option<usize> {
        Some(self.cores_per_rank)
    }

    fn exec_path(&self) -> PathBuf {
        self.exec.clone()
    }

    fn exec_args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn setup_text(&self) -> String {
        "ulimit -s unlimited\nexport I_MPI_FABRICS=shm\n".into()
    }

    fn trial_setup(&self, _run_id: &str, _output_dir: &Path) -> Result<()> {
        match self.exp_setup.as_ref() {
            Some(script) => run_hook_script(script),
            None => Ok(()),
        }
    }

    fn experiment_teardown(&self, _output_dir: &Path) -> Result<()> {
        match self.teardown.as_ref() {
            Some(script) => run_hook_script(script),
            None => Ok(()),
        }
    }

    fn parse_fom(&self, log_path: &Path) -> Option<f64> {
        scan_fom(log_path, self.kernel.fom_re(), FomPick::Last)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_machine;
    use super::*;
    use std::fs;

    fn create(kernel: ParresKernel, input: &str, nodes: usize) -> Result<Parres> {
        let props = geopm_exp_intf::Args::parse_propset(input);
        let mut opts = AppOpts::new("parres", &props);
        let app = Parres::new(kernel, &mut opts, &test_machine(), nodes)?;
        opts.finish()?;
        Ok(app)
    }

    #[test]
    fn test_layout_restrictions() {
        use ParresKernel::*;
        for (kernel, input, nodes, expected) in &[
            (Dgemm, "", 1, Some((4, 1))),
            (Dgemm, "cores-per-node=8,cores-per-rank=2", 1, Some((4, 2))),
            (Dgemm, "", 2, None),
            (Dgemm, "cores-per-node=64", 1, None),
            (Dgemm, "gpus-per-node=2", 1, None),
            (Dgemm, "cores-per-node=6,cores-per-rank=4", 1, None),
            (Nstream, "", 1, Some((1, 1))),
            (Nstream, "cores-per-node=2", 1, None),
            (Nstream, "exp-setup=/nonexistent/setup.sh", 1, None),
        ] {
            let res = create(*kernel, input, *nodes);
            let layout = res
                .as_ref()
                .ok()
                .map(|app| (app.rank_per_node(), app.cpu_per_rank().unwrap()));
            println!("{:?} {:?} {} -> {:?}", kernel, input, nodes, &layout);
            assert_eq!(layout, *expected);
            if let Err(e) = res {
                assert!(e.downcast_ref::<ExpError>().is_some());
            }
        }
    }

    #[test]
    fn test_parse_fom_last_match() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("parres.log");
        fs::write(
            &log,
            "Rank 0: AVG Rate (MF/s): 1000.0 Avg time (s): 1.0\nRank 1: AVG Rate (MF/s): 1250.5 Avg time (s): 0.8\n",
        )
        .unwrap();
        let dgemm = create(ParresKernel::Dgemm, "", 1).unwrap();
        assert_eq!(dgemm.parse_fom(&log), Some(1250.5));
        let nstream = create(ParresKernel::Nstream, "", 1).unwrap();
        assert_eq!(nstream.parse_fom(&log), None);
        assert_eq!(dgemm.exec_args(), vec!["10", "16000"]);
    }
}
