// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use geopm_util::*;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::env;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{spawn, JoinHandle};

use super::config::{CtlMode, GeopmConfig, AFFINITY_ENV};
use super::subset::{parse_subset, OptSpec, ParsedOpts};
use super::topo::{affinity_list, cpu_mask_hex, AffinityRequest, CpuSet, Topology};

const SRUN_OPTS: &[OptSpec] = &[
    OptSpec::value("num_rank", &["-n", "--ntasks"]),
    OptSpec::value("num_node", &["-N", "--nodes"]),
    OptSpec::value("cpu_per_rank", &["-c", "--cpus-per-task"]),
    OptSpec::value("timeout", &["-I", "--immediate"]),
    OptSpec::value("time_limit", &["-t", "--time"]),
    OptSpec::value("job_name", &["-J", "--job-name"]),
    OptSpec::value("node_list", &["-w", "--nodelist"]),
    OptSpec::value("rank_per_node", &["--ntasks-per-node"]),
];

const APRUN_OPTS: &[OptSpec] = &[
    OptSpec::value("num_rank", &["-n", "--pes"]),
    OptSpec::value("rank_per_node", &["-N", "--pes-per-node"]),
    OptSpec::value("cpu_per_rank", &["-d", "--cpus-per-pe"]),
    OptSpec::value("time_limit", &["-t", "--cpu-time-limit"]),
    OptSpec::value("node_list", &["-L", "--node-list"]),
    OptSpec::value("host_file", &["-l", "--node-list-file"]),
];

const IMPI_OPTS: &[OptSpec] = &[
    OptSpec::value("num_rank", &["-n", "-np"]),
    OptSpec::value("rank_per_node", &["-ppn", "-perhost"]),
    OptSpec::value("node_list", &["-hosts"]),
    OptSpec::value("host_file", &["-f", "-hostfile", "-machinefile"]),
];

/// Supported job launchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceManager {
    Slurm,
    SlurmToss,
    Alps,
    Impi,
}

impl ResourceManager {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "SLURM" | "srun" | "SrunLauncher" => Self::Slurm,
            "SLURM_TOSS" | "srun_toss" | "SrunTOSSLauncher" => Self::SlurmToss,
            "ALPS" | "aprun" | "AprunLauncher" => Self::Alps,
            "IMPI" | "impi" | "IMPIExecLauncher" => Self::Impi,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Slurm => "SLURM",
            Self::SlurmToss => "SLURM_TOSS",
            Self::Alps => "ALPS",
            Self::Impi => "IMPI",
        }
    }

    pub fn exec(&self) -> &'static str {
        match self {
            Self::Slurm | Self::SlurmToss => "srun",
            Self::Alps => "aprun",
            Self::Impi => "mpiexec.hydra",
        }
    }

    fn options(&self) -> &'static [OptSpec] {
        match self {
            Self::Slurm | Self::SlurmToss => SRUN_OPTS,
            Self::Alps => APRUN_OPTS,
            Self::Impi => IMPI_OPTS,
        }
    }

    // Affinity options which conflict with the ones we generate.
    fn reserved_opts(&self) -> &'static [&'static str] {
        match self {
            Self::Slurm => &["--cpu_bind", "--cpu-bind"],
            Self::SlurmToss => &["--cpu_bind", "--cpu-bind", "--mpibind"],
            Self::Alps => &["--cpu-binding", "-cc"],
            Self::Impi => &[],
        }
    }

    fn is_slurm(&self) -> bool {
        matches!(self, Self::Slurm | Self::SlurmToss)
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        if self.is_slurm() {
            InterruptMode::ConfirmWithin1s
        } else {
            InterruptMode::Forward
        }
    }
}

/// Node properties the launcher needs but can only learn by asking the
/// system.
pub trait NodeQuery {
    fn topology(&self, rm: ResourceManager) -> Result<Topology>;
    fn has_mpibind(&self, rm: ResourceManager) -> bool;
}

/// Runs lscpu on a compute node through the launcher itself and checks
/// `srun --help` for the mpibind plugin.
pub struct SystemQuery;

impl NodeQuery for SystemQuery {
    fn topology(&self, rm: ResourceManager) -> Result<Topology> {
        let ovr = LaunchOverrides {
            num_rank: Some(1),
            num_node: Some(1),
            ..Default::default()
        };
        let argv = vec!["--geopm-ctl-disable".to_string(), "lscpu".to_string()];
        let mut launcher = Launcher::with_query(rm, &argv, ovr, self)?;
        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        launcher
            .run(&mut out, &mut err)
            .context("Running lscpu on a compute node")?;
        Topology::parse_lscpu(&String::from_utf8_lossy(&out))
    }

    fn has_mpibind(&self, rm: ResourceManager) -> bool {
        if !rm.is_slurm() {
            return false;
        }
        match Command::new(rm.exec()).arg("--help").output() {
            Ok(output) => {
                String::from_utf8_lossy(&output.stdout).contains("mpibind")
                    || String::from_utf8_lossy(&output.stderr).contains("mpibind")
            }
            Err(_) => false,
        }
    }
}

/// Values that take precedence over whatever the launcher command line
/// says. `time_limit` is in seconds for every launcher.
#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub num_rank: Option<usize>,
    pub num_node: Option<usize>,
    pub cpu_per_rank: Option<usize>,
    pub timeout: Option<u64>,
    pub time_limit: Option<u64>,
    pub job_name: Option<String>,
    pub node_list: Option<String>,
    pub host_file: Option<String>,
}

impl LaunchOverrides {
    fn is_empty(&self) -> bool {
        self.num_rank.is_none()
            && self.num_node.is_none()
            && self.cpu_per_rank.is_none()
            && self.timeout.is_none()
            && self.time_limit.is_none()
            && self.job_name.is_none()
            && self.node_list.is_none()
            && self.host_file.is_none()
    }
}

struct RunningChild {
    argv: Vec<String>,
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct Launcher {
    rm: ResourceManager,
    exec: String,
    argv_passthrough: Vec<String>,
    argv_unparsed: Vec<String>,
    config: Option<GeopmConfig>,
    is_override_enabled: bool,
    num_rank: Option<usize>,
    num_node: Option<usize>,
    rank_per_node: Option<usize>,
    cpu_per_rank: usize,
    timeout: Option<u64>,
    time_limit: Option<u64>,
    job_name: Option<String>,
    node_list: Option<String>,
    host_file: Option<String>,
    num_app_mask: usize,
    topo: Option<Topology>,
    mpibind: bool,
    cwd: Option<PathBuf>,
}

impl Launcher {
    /// `argv` holds the launcher options following the launcher name.
    pub fn new(rm: ResourceManager, argv: &[String], ovr: LaunchOverrides) -> Result<Self> {
        Self::with_query(rm, argv, ovr, &SystemQuery)
    }

    pub fn with_query(
        rm: ResourceManager,
        argv: &[String],
        ovr: LaunchOverrides,
        query: &dyn NodeQuery,
    ) -> Result<Self> {
        let (config, argv_passthrough) = GeopmConfig::parse(argv)?;
        let opts = parse_subset(rm.options(), &argv_passthrough)?;

        let mut launcher = Self {
            rm,
            exec: rm.exec().to_string(),
            argv_unparsed: opts.unparsed.clone(),
            argv_passthrough,
            is_override_enabled: config.is_some() || !ovr.is_empty(),
            config,
            num_rank: None,
            num_node: None,
            rank_per_node: None,
            cpu_per_rank: 1,
            timeout: None,
            time_limit: None,
            job_name: None,
            node_list: None,
            host_file: None,
            num_app_mask: 0,
            topo: None,
            mpibind: false,
            cwd: None,
        };
        let cpu_per_rank = launcher.parse_launcher_opts(&opts)?;

        if launcher.config.is_some() {
            let reserved = rm.reserved_opts();
            for arg in launcher.argv_passthrough.iter().take_while(|a| *a != "--") {
                if reserved.iter().any(|r| arg.starts_with(r)) {
                    config_bail!(
                        "The option {} must not be specified, CPU affinity is controlled by the launcher",
                        arg
                    );
                }
            }
        }

        launcher.apply_overrides(ovr, cpu_per_rank);

        if let Some(config) = launcher.config.as_ref() {
            let ctl = config.ctl();
            if launcher.num_rank.is_none() {
                config_bail!("Number of MPI ranks must be specified");
            }
            if launcher.num_node.is_none() {
                config_bail!("Number of nodes must be specified");
            }
            if ctl == CtlMode::Application {
                match rm {
                    ResourceManager::Alps => {
                        config_bail!("--geopm-ctl=application is not supported with aprun")
                    }
                    ResourceManager::Slurm | ResourceManager::SlurmToss => {
                        let nnodes = env::var("SLURM_NNODES").ok();
                        if nnodes != launcher.num_node.map(|n| format!("{}", n)) {
                            config_bail!(
                                "--geopm-ctl=application with srun must be run inside an allocation \
                                 and use all allocated nodes (SLURM_NNODES={:?})",
                                nnodes
                            );
                        }
                    }
                    ResourceManager::Impi => {}
                }
            }

            launcher.topo = Some(query.topology(rm)?);
            launcher.mpibind = query.has_mpibind(rm);

            if ctl == CtlMode::Process {
                launcher.num_rank = launcher.num_rank.map(|r| r + launcher.num_node.unwrap_or(0));
                launcher.rank_per_node = launcher.rank_per_node.map(|r| r + 1);
            }
        }
        debug!("launcher: {:?}", &launcher);
        Ok(launcher)
    }

    // Returns the cpus-per-rank found on the command line.
    fn parse_launcher_opts(&mut self, opts: &ParsedOpts) -> Result<Option<usize>> {
        self.num_rank = opts.int("num_rank")?;
        self.num_node = opts.int("num_node")?;
        self.rank_per_node = opts.int("rank_per_node")?;
        self.job_name = opts.owned("job_name");
        self.node_list = opts.owned("node_list");
        self.host_file = opts.owned("host_file");
        self.timeout = opts.int("timeout")?.map(|v| v as u64);
        let cpu_per_rank = opts.int("cpu_per_rank")?;

        let time_limit = opts.int("time_limit")?.map(|v| v as u64);
        self.time_limit = match self.rm {
            // minutes
            ResourceManager::Slurm | ResourceManager::SlurmToss => time_limit.map(|t| t * 60),
            // CPU seconds per process
            ResourceManager::Alps => match cpu_per_rank {
                Some(cpr) if cpr > 0 => time_limit.map(|t| int_ceil_div(t as usize, cpr) as u64),
                _ => time_limit,
            },
            ResourceManager::Impi => None,
        };
        Ok(cpu_per_rank)
    }

    fn apply_overrides(&mut self, ovr: LaunchOverrides, cpu_per_rank: Option<usize>) {
        if ovr.num_rank.is_some() {
            self.num_rank = ovr.num_rank;
        }
        if ovr.num_node.is_some() {
            self.num_node = ovr.num_node;
        }
        if ovr.timeout.is_some() {
            self.timeout = ovr.timeout;
        }
        if ovr.time_limit.is_some() {
            self.time_limit = ovr.time_limit;
        }
        if ovr.job_name.is_some() {
            self.job_name = ovr.job_name;
        }
        if ovr.node_list.is_some() {
            self.node_list = ovr.node_list;
        }
        if ovr.host_file.is_some() {
            self.host_file = ovr.host_file;
        }

        match (self.num_rank, self.num_node, self.rank_per_node) {
            (Some(rank), Some(node), _) if node > 0 => {
                self.rank_per_node = Some(int_ceil_div(rank, node))
            }
            (Some(rank), None, Some(rpn)) if rpn > 0 => {
                self.num_node = Some(int_ceil_div(rank, rpn))
            }
            _ => {}
        }
        self.num_app_mask = self.rank_per_node.unwrap_or(0);

        self.cpu_per_rank = match ovr.cpu_per_rank.or(cpu_per_rank) {
            Some(v) => v,
            None => env::var("OMP_NUM_THREADS")
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(1),
        };
    }

    /// Replace the launcher executable, e.g. with an absolute path.
    pub fn with_exec(mut self, exec: &str) -> Self {
        self.exec = exec.to_string();
        self
    }

    /// Working directory of the launched job. Defaults to ours.
    pub fn set_cwd<P: AsRef<Path>>(&mut self, dir: P) {
        self.cwd = Some(dir.as_ref().to_path_buf());
    }

    pub fn rm(&self) -> ResourceManager {
        self.rm
    }

    pub fn is_geopm_enabled(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> Option<&GeopmConfig> {
        self.config.as_ref()
    }

    pub fn num_rank(&self) -> Option<usize> {
        self.num_rank
    }

    pub fn num_node(&self) -> Option<usize> {
        self.num_node
    }

    pub fn rank_per_node(&self) -> Option<usize> {
        self.rank_per_node
    }

    pub fn cpu_per_rank(&self) -> usize {
        self.cpu_per_rank
    }

    pub fn time_limit(&self) -> Option<u64> {
        self.time_limit
    }

    fn ctl(&self) -> Option<CtlMode> {
        self.config.as_ref().map(|c| c.ctl())
    }

    pub fn affinity_list(&self, is_geopmctl: bool) -> Result<Vec<CpuSet>> {
        let topo = self
            .topo
            .as_ref()
            .ok_or_else(|| anyhow!("topology unknown while GEOPM is disabled"))?;
        affinity_list(
            topo,
            &AffinityRequest {
                rank_per_node: self.num_app_mask,
                cpu_per_rank: self.cpu_per_rank,
                ctl: self.ctl(),
                is_geopmctl,
                hyperthreads_disabled: self
                    .config
                    .as_ref()
                    .map(|c| c.hyperthreads_disabled)
                    .unwrap_or(false),
            },
        )
    }

    fn num_cpu(&self) -> usize {
        self.topo.map(|t| t.num_cpu).unwrap_or(0)
    }

    fn num_node_option(&self, is_geopmctl: bool) -> Vec<String> {
        match self.rm {
            ResourceManager::Slurm | ResourceManager::SlurmToss => match self.num_node {
                Some(node) => vec!["-N".into(), format!("{}", node)],
                None => vec![],
            },
            ResourceManager::Alps => match (self.num_rank, self.num_node) {
                (Some(rank), Some(node)) => {
                    vec!["-N".into(), format!("{}", int_ceil_div(rank, node))]
                }
                _ => vec![],
            },
            ResourceManager::Impi => match (is_geopmctl, self.rank_per_node) {
                (true, _) => vec!["-ppn".into(), "1".into()],
                (false, Some(rpn)) => vec!["-ppn".into(), format!("{}", rpn)],
                _ => vec![],
            },
        }
    }

    fn num_rank_option(&self, is_geopmctl: bool) -> Vec<String> {
        match (self.num_node, self.num_rank) {
            (Some(node), Some(rank)) => {
                let nr = if is_geopmctl { node } else { rank };
                vec!["-n".into(), format!("{}", nr)]
            }
            _ => vec![],
        }
    }

    fn affinity_option(&self, is_geopmctl: bool) -> Result<Vec<String>> {
        if !self.is_geopm_enabled() {
            return Ok(vec![]);
        }
        let aff = self.affinity_list(is_geopmctl)?;
        let num_cpu = self.num_cpu();

        Ok(match self.rm {
            ResourceManager::Slurm => {
                let masks: Vec<String> = aff
                    .iter()
                    .map(|set| format!("0x{}", cpu_mask_hex(set, num_cpu)))
                    .collect();
                let mut opts = vec![format!("--cpu_bind=v,mask_cpu:{}", masks.join(","))];
                if self.mpibind {
                    opts.push("--mpibind=off".into());
                }
                opts
            }
            ResourceManager::SlurmToss => {
                let sets: Vec<String> = aff.iter().map(|set| range_str(set.iter())).collect();
                vec![format!("--mpibind=v.{}", sets.join(","))]
            }
            ResourceManager::Alps => {
                let sets: Vec<String> = aff.iter().map(|set| range_str(set.iter())).collect();
                vec!["--cpu-binding".into(), sets.join(":")]
            }
            // pinned through I_MPI_PIN_DOMAIN
            ResourceManager::Impi => vec![],
        })
    }

    fn timeout_option(&self) -> Vec<String> {
        match (self.rm.is_slurm(), self.timeout) {
            (true, Some(t)) => vec![format!("-I{}", t)],
            _ => vec![],
        }
    }

    fn time_limit_option(&self) -> Vec<String> {
        match (self.rm, self.time_limit) {
            (ResourceManager::Slurm, Some(t)) | (ResourceManager::SlurmToss, Some(t)) => {
                vec!["-t".into(), format!("{}", int_ceil_div(t as usize, 60))]
            }
            (ResourceManager::Alps, Some(t)) => {
                vec!["-t".into(), format!("{}", t * self.cpu_per_rank as u64)]
            }
            _ => vec![],
        }
    }

    fn job_name_option(&self) -> Vec<String> {
        match (self.rm.is_slurm(), self.job_name.as_ref()) {
            (true, Some(name)) => vec!["-J".into(), name.clone()],
            _ => vec![],
        }
    }

    fn node_list_option(&self) -> Result<Vec<String>> {
        Ok(match self.rm {
            ResourceManager::Slurm | ResourceManager::SlurmToss => {
                match (self.node_list.as_ref(), self.host_file.as_ref()) {
                    (Some(nl), Some(hf)) if nl != hf => {
                        config_bail!("Node list and host file cannot both be specified")
                    }
                    (Some(v), _) | (None, Some(v)) => vec!["-w".into(), v.clone()],
                    (None, None) => vec![],
                }
            }
            ResourceManager::Alps => match self.node_list.as_ref() {
                Some(v) => vec!["-L".into(), v.clone()],
                None => vec![],
            },
            ResourceManager::Impi => match self.node_list.as_ref() {
                Some(v) => vec!["-hosts".into(), v.clone()],
                None => vec![],
            },
        })
    }

    fn host_file_option(&self) -> Vec<String> {
        let flag = match self.rm {
            ResourceManager::Alps => "-l",
            ResourceManager::Impi => "-f",
            // srun takes the host file through -w
            _ => return vec![],
        };
        match self.host_file.as_ref() {
            Some(v) => vec![flag.into(), v.clone()],
            None => vec![],
        }
    }

    fn launcher_options(&self, is_geopmctl: bool) -> Result<Vec<String>> {
        let mut opts = vec![];
        opts.extend(self.num_node_option(is_geopmctl));
        opts.extend(self.num_rank_option(is_geopmctl));
        opts.extend(self.affinity_option(is_geopmctl)?);
        opts.extend(self.timeout_option());
        opts.extend(self.time_limit_option());
        opts.extend(self.job_name_option());
        opts.extend(self.node_list_option()?);
        opts.extend(self.host_file_option());
        Ok(opts)
    }

    /// The complete command line, launcher executable first.
    pub fn command_argv(&self) -> Result<Vec<String>> {
        let mut argv = vec![self.exec.clone()];
        if self.is_override_enabled {
            argv.extend(self.launcher_options(false)?);
            argv.extend(self.argv_unparsed.iter().cloned());
        } else {
            argv.extend(self.argv_passthrough.iter().cloned());
        }
        Ok(argv)
    }

    /// Command line of the separate controller job, only in application
    /// ctl mode.
    pub fn geopmctl_argv(&self) -> Result<Option<Vec<String>>> {
        let config = match self.config.as_ref() {
            Some(c) if c.ctl() == CtlMode::Application => c,
            _ => return Ok(None),
        };
        let mut argv = vec![self.exec.clone()];
        argv.extend(self.launcher_options(true)?);
        argv.push("geopmctl".into());
        if let Some(policy) = config.policy.as_ref() {
            argv.push("-c".into());
            argv.push(policy.clone());
        }
        if let Some(shmkey) = config.shmkey.as_ref() {
            argv.push("-s".into());
            argv.push(shmkey.clone());
        }
        Ok(Some(argv))
    }

    fn job_config(&self, is_geopmctl: bool) -> Option<GeopmConfig> {
        self.config.as_ref().map(|c| {
            let mut c = c.clone();
            c.omp_num_threads = Some(if is_geopmctl { 1 } else { self.cpu_per_rank });
            c
        })
    }

    /// Variables added on top of the inherited environment.
    pub fn environ(&self, is_geopmctl: bool) -> Result<BTreeMap<String, String>> {
        let mut env = match self.job_config(is_geopmctl) {
            Some(c) => c.environ(),
            None => {
                return Ok(AFFINITY_ENV
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect())
            }
        };
        if self.rm == ResourceManager::Impi {
            let masks: Vec<String> = self
                .affinity_list(is_geopmctl)?
                .iter()
                .map(|set| cpu_mask_hex(set, self.num_cpu()))
                .collect();
            env.insert("I_MPI_PIN_DOMAIN".into(), format!("[{}]", masks.join(",")));
        }
        Ok(env)
    }

    /// What gets printed before launching: a blank line, the environment
    /// we add and the command.
    pub fn echo(&self) -> Result<String> {
        let mut words = vec![];
        if let Some(c) = self.job_config(false) {
            words.push(format!("{}", c));
        }
        words.extend(self.command_argv()?);
        Ok(format!("\n{}\n\n", words.join(" ")))
    }

    fn spawn(
        &self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        out_tx: &Sender<String>,
        err_tx: &Sender<String>,
    ) -> Result<RunningChild> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = self.cwd.as_ref() {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute {:?}", argv.join(" ")))?;
        register_child(child.id(), self.rm.interrupt_mode());

        let mut readers = vec![];
        if let Some(stdout) = child.stdout.take() {
            let (name, tx) = (format!("{}-stdout", &argv[0]), out_tx.clone());
            readers.push(spawn(move || child_reader_thread(name, stdout, tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let (name, tx) = (format!("{}-stderr", &argv[0]), err_tx.clone());
            readers.push(spawn(move || child_reader_thread(name, stderr, tx)));
        }
        Ok(RunningChild {
            argv: argv.to_vec(),
            child,
            readers,
        })
    }

    fn pump_output(
        out_rx: Receiver<String>,
        err_rx: Receiver<String>,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<()> {
        let (mut out_rx, mut err_rx) = (out_rx, err_rx);
        let (mut out_open, mut err_open) = (true, true);
        let mut write_err = None;

        while out_open || err_open {
            let (line, to_out) = channel::select! {
                recv(out_rx) -> msg => match msg {
                    Ok(line) => (line, true),
                    Err(_) => {
                        out_open = false;
                        out_rx = channel::never();
                        continue;
                    }
                },
                recv(err_rx) -> msg => match msg {
                    Ok(line) => (line, false),
                    Err(_) => {
                        err_open = false;
                        err_rx = channel::never();
                        continue;
                    }
                },
            };
            let sink: &mut dyn Write = if to_out { &mut *stdout } else { &mut *stderr };
            if let Err(e) = writeln!(sink, "{}", line) {
                if write_err.is_none() {
                    write_err = Some(e);
                }
            }
        }
        let _ = stdout.flush();
        let _ = stderr.flush();
        match write_err {
            Some(e) => Err(e).context("Writing child output"),
            None => Ok(()),
        }
    }

    /// Launch the job, and the controller job in application ctl mode,
    /// copying their output to `stdout` and `stderr` line by line. Fails
    /// if any of them exits unsuccessfully.
    pub fn run(&mut self, stdout: &mut dyn Write, stderr: &mut dyn Write) -> Result<()> {
        let argv = self.command_argv()?;
        let env = self.environ(false)?;
        let ctl_job = match self.geopmctl_argv()? {
            Some(ctl_argv) => Some((ctl_argv, self.environ(true)?)),
            None => None,
        };

        stdout.write_all(self.echo()?.as_bytes())?;
        stdout.flush()?;
        setup_prog_state();

        let (out_tx, out_rx) = channel::unbounded::<String>();
        let (err_tx, err_rx) = channel::unbounded::<String>();
        let mut children = vec![];

        if let Some((ctl_argv, ctl_env)) = ctl_job.as_ref() {
            children.push(self.spawn(ctl_argv, ctl_env, &out_tx, &err_tx)?);
        }
        match self.spawn(&argv, &env, &out_tx, &err_tx) {
            Ok(child) => children.push(child),
            Err(e) => {
                for rc in children.iter_mut() {
                    let _ = rc.child.kill();
                    let _ = rc.child.wait();
                    unregister_child(rc.child.id());
                }
                return Err(e);
            }
        }
        drop(out_tx);
        drop(err_tx);

        let pumped = Self::pump_output(out_rx, err_rx, stdout, stderr);

        // The application's failure is reported ahead of the controller's.
        let mut failure = None;
        for mut rc in children.into_iter().rev() {
            let status = rc.child.wait();
            unregister_child(rc.child.id());
            for reader in rc.readers.drain(..) {
                if reader.join().is_err() {
                    warn!("launcher: reader thread for {:?} panicked", &rc.argv[0]);
                }
            }
            let status = match status {
                Ok(st) if st.success() => continue,
                Ok(st) => format!("{}", st),
                Err(e) => format!("{}", e),
            };
            if failure.is_none() {
                failure = Some(ExpError::Launch {
                    cmd: rc.argv.join(" "),
                    status,
                });
            }
        }

        if let Some(e) = failure {
            return Err(e.into());
        }
        pumped
    }

    fn sinfo_nodes(&self, state: &str) -> Result<Vec<String>> {
        if !self.rm.is_slurm() {
            bail!("{}: node queries are not implemented", self.rm.exec());
        }
        let output = command_output(Command::new("sinfo").args(&["-t", state, "-hNo", "%N"]))?;
        Ok(output
            .lines()
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect())
    }

    /// Compute nodes currently available to run jobs.
    pub fn idle_nodes(&self) -> Result<Vec<String>> {
        self.sinfo_nodes("idle")
    }

    /// Compute nodes reserved for the current job context.
    pub fn alloc_nodes(&self) -> Result<Vec<String>> {
        self.sinfo_nodes("alloc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedQuery(Topology, bool);

    impl NodeQuery for FixedQuery {
        fn topology(&self, _rm: ResourceManager) -> Result<Topology> {
            Ok(self.0)
        }
        fn has_mpibind(&self, _rm: ResourceManager) -> bool {
            self.1
        }
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    fn launcher(rm: ResourceManager, argv: &[&str], ovr: LaunchOverrides) -> Result<Launcher> {
        Launcher::with_query(rm, &strs(argv), ovr, &FixedQuery(Topology::new(2, 20, 2), false))
    }

    #[test]
    fn test_srun_process_full_node() {
        let l = launcher(
            ResourceManager::Slurm,
            &["-N", "2", "-n", "80", "-c", "1", "--geopm-report=r.report", "--", "app", "a1"],
            Default::default(),
        )
        .unwrap();
        assert_eq!(l.num_rank(), Some(82));
        assert_eq!(l.rank_per_node(), Some(41));

        let argv = l.command_argv().unwrap();
        println!("{:?}", &argv);
        assert_eq!(&argv[0..5], &strs(&["srun", "-N", "2", "-n", "82"])[..]);
        let bind = &argv[5];
        assert!(bind.starts_with("--cpu_bind=v,mask_cpu:0x00000000010000000000,"));
        assert_eq!(bind.split(',').count() - 1, 41);
        assert_eq!(&argv[6..], &strs(&["--", "app", "a1"])[..]);
        assert!(!argv.iter().any(|a| a.starts_with("--geopm")));

        let env = l.environ(false).unwrap();
        assert_eq!(env["GEOPM_REPORT"], "r.report");
        assert_eq!(env["OMP_NUM_THREADS"], "1");
        assert_eq!(env["GEOPM_CTL"], "process");
    }

    #[test]
    fn test_srun_passthrough_and_options() {
        let ovr = LaunchOverrides {
            time_limit: Some(90),
            job_name: Some("sweep".into()),
            timeout: Some(30),
            ..Default::default()
        };
        let l = launcher(
            ResourceManager::Slurm,
            &["--mem", "10G", "-n", "4", "-N", "1", "-c", "2", "--mpi=pmix", "--", "app"],
            ovr,
        )
        .unwrap();
        let argv = l.command_argv().unwrap();
        let expected = strs(&["-I30", "-t", "2", "-J", "sweep", "--mem", "10G", "--mpi=pmix", "--", "app"]);
        assert_eq!(&argv[argv.len() - expected.len()..], &expected[..]);

        let l = launcher(ResourceManager::Slurm, &["-t", "5", "-N", "1", "-n", "1", "-c", "1"], Default::default())
            .unwrap();
        assert_eq!(l.time_limit(), Some(300));
        let argv = l.command_argv().unwrap();
        let idx = argv.iter().position(|a| a == "-t").unwrap();
        assert_eq!(argv[idx + 1], "5");
    }

    #[test]
    fn test_ctl_disabled_passthrough() {
        let l = launcher(
            ResourceManager::Slurm,
            &["--geopm-ctl-disable", "-n", "2", "--", "hostname"],
            Default::default(),
        )
        .unwrap();
        assert!(!l.is_geopm_enabled());
        assert_eq!(l.command_argv().unwrap(), strs(&["srun", "-n", "2", "--", "hostname"]));
        let env = l.environ(false).unwrap();
        println!("{:?}", &env);
        assert_eq!(env.len(), 2);
        assert_eq!(env["KMP_AFFINITY"], "disabled");
        assert_eq!(env["MV2_ENABLE_AFFINITY"], "0");

        let ovr = LaunchOverrides {
            num_rank: Some(1),
            num_node: Some(1),
            ..Default::default()
        };
        let l = launcher(ResourceManager::Slurm, &["--geopm-ctl-disable", "lscpu"], ovr).unwrap();
        assert_eq!(
            l.command_argv().unwrap(),
            strs(&["srun", "-N", "1", "-n", "1", "lscpu"])
        );
    }

    #[test]
    fn test_srun_errors() {
        let err = launcher(
            ResourceManager::Slurm,
            &["-N", "1", "-n", "2", "--cpu_bind=none", "app"],
            Default::default(),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<ExpError>().is_some());
        assert!(launcher(ResourceManager::Slurm, &["-n", "2", "app"], Default::default()).is_err());

        let ovr = LaunchOverrides {
            node_list: Some("a,b".into()),
            host_file: Some("/tmp/hosts".into()),
            ..Default::default()
        };
        let l = launcher(ResourceManager::Slurm, &["--geopm-ctl-disable", "app"], ovr).unwrap();
        assert!(l.command_argv().is_err());
    }

    #[test]
    fn test_srun_mpibind_and_toss() {
        let query = FixedQuery(Topology::new(1, 4, 1), true);
        let l = Launcher::with_query(
            ResourceManager::Slurm,
            &strs(&["-N", "1", "-n", "2", "-c", "1", "--geopm-ctl", "pthread", "app"]),
            Default::default(),
            &query,
        )
        .unwrap();
        let argv = l.command_argv().unwrap();
        assert_eq!(argv[5], "--cpu_bind=v,mask_cpu:0x5,0x8");
        assert_eq!(argv[6], "--mpibind=off");

        let l = Launcher::with_query(
            ResourceManager::SlurmToss,
            &strs(&["-N", "1", "-n", "2", "-c", "1", "app"]),
            Default::default(),
            &query,
        )
        .unwrap();
        let argv = l.command_argv().unwrap();
        assert_eq!(argv[5], "--mpibind=v.0,2,3");
    }

    #[test]
    fn test_aprun() {
        let query = FixedQuery(Topology::new(1, 8, 1), false);
        let l = Launcher::with_query(
            ResourceManager::Alps,
            &strs(&["-n", "8", "-N", "4", "-d", "2", "-t", "100", "--", "app"]),
            Default::default(),
            &query,
        )
        .unwrap();
        assert_eq!(l.num_node(), Some(2));
        assert_eq!(l.time_limit(), Some(50));
        assert_eq!(
            l.command_argv().unwrap(),
            strs(&[
                "aprun",
                "-N",
                "5",
                "-n",
                "10",
                "--cpu-binding",
                "0:0-1:2-3:4-5:6-7",
                "-t",
                "100",
                "--",
                "app"
            ])
        );

        for argv in &[
            vec!["-n", "8", "-N", "4", "--geopm-ctl=application", "app"],
            vec!["-n", "8", "-N", "4", "-cc", "none", "app"],
        ] {
            assert!(Launcher::with_query(ResourceManager::Alps, &strs(argv), Default::default(), &query).is_err());
        }
    }

    #[test]
    fn test_impi_application_ctl() {
        let query = FixedQuery(Topology::new(1, 4, 1), false);
        let l = Launcher::with_query(
            ResourceManager::Impi,
            &strs(&["-n", "4", "-ppn", "2", "--geopm-ctl", "application", "--geopm-policy", "pol.json", "--", "app"]),
            LaunchOverrides {
                cpu_per_rank: Some(1),
                ..Default::default()
            },
            &query,
        )
        .unwrap();
        assert_eq!(l.num_node(), Some(2));
        assert_eq!(
            l.command_argv().unwrap(),
            strs(&["mpiexec.hydra", "-ppn", "2", "-n", "4", "--", "app"])
        );
        assert_eq!(
            l.geopmctl_argv().unwrap().unwrap(),
            strs(&["mpiexec.hydra", "-ppn", "1", "-n", "2", "geopmctl", "-c", "pol.json"])
        );
        let env = l.environ(false).unwrap();
        assert_eq!(env["I_MPI_PIN_DOMAIN"], "[4,8]");
        let env = l.environ(true).unwrap();
        assert_eq!(env["I_MPI_PIN_DOMAIN"], "[1]");
        assert_eq!(env["OMP_NUM_THREADS"], "1");
    }

    #[test]
    fn test_run_streams_output() {
        let l = launcher(
            ResourceManager::Impi,
            &["--geopm-ctl-disable", "-c", "echo out; echo err >&2"],
            Default::default(),
        )
        .unwrap();
        let mut l = l.with_exec("sh");
        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        l.run(&mut out, &mut err).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("\nsh -c echo out; echo err >&2\n\n"));
        assert!(out.ends_with("out\n"));
        assert_eq!(String::from_utf8(err).unwrap(), "err\n");
    }

    #[test]
    fn test_run_failure_carries_command() {
        let l = launcher(ResourceManager::Alps, &["--geopm-ctl-disable", "-c", "exit 3"], Default::default())
            .unwrap();
        let mut l = l.with_exec("sh");
        let err = l.run(&mut std::io::sink(), &mut std::io::sink()).unwrap_err();
        match err.downcast_ref::<ExpError>() {
            Some(ExpError::Launch { cmd, status }) => {
                assert_eq!(cmd, "sh -c exit 3");
                assert!(status.contains('3'));
            }
            v => panic!("unexpected error {:?}", v),
        }
    }

    #[test]
    fn test_node_queries_unsupported() {
        let l = launcher(ResourceManager::Alps, &["--geopm-ctl-disable", "app"], Default::default()).unwrap();
        assert!(l.idle_nodes().is_err());
        assert!(l.alloc_nodes().is_err());
    }
}
