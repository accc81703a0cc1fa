// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use geopm_util::{config_bail, exe_dir};
use log::debug;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::Path;

use super::subset::{parse_subset, OptKind, OptSpec};

/// Runtime affinity settings cleared for every launch, with or without
/// the controller.
pub const AFFINITY_ENV: &[(&str, &str)] =
    &[("KMP_AFFINITY", "disabled"), ("MV2_ENABLE_AFFINITY", "0")];

/// How the GEOPM controller is attached to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlMode {
    /// One extra MPI rank per node runs the controller.
    Process,
    /// The controller runs as a thread inside rank 0 of each node.
    Pthread,
    /// The controller is a separate `geopmctl` job.
    Application,
}

impl CtlMode {
    pub fn parse(input: &str) -> Result<Self> {
        Ok(match input {
            "process" => Self::Process,
            "pthread" => Self::Pthread,
            "application" => Self::Application,
            v => config_bail!(
                "--geopm-ctl must be one of \"process\", \"pthread\" or \"application\", got {:?}",
                v
            ),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Pthread => "pthread",
            Self::Application => "application",
        }
    }
}

pub const GEOPM_OPTS: &[OptSpec] = &[
    OptSpec::value("ctl", &["--geopm-ctl"]),
    OptSpec::flag("ctl_disable", &["--geopm-ctl-disable"]),
    OptSpec::value("agent", &["--geopm-agent"]),
    OptSpec::value("policy", &["--geopm-policy"]),
    OptSpec::value("report", &["--geopm-report"]),
    OptSpec::value("trace", &["--geopm-trace"]),
    OptSpec::value("trace_profile", &["--geopm-trace-profile"]),
    OptSpec::value("profile", &["--geopm-profile"]),
    OptSpec::value("shmkey", &["--geopm-shmkey"]),
    OptSpec::value("timeout", &["--geopm-timeout"]),
    OptSpec::value("plugin", &["--geopm-plugin-path"]),
    OptSpec::value("debug_attach", &["--geopm-debug-attach"]),
    OptSpec::flag("barrier", &["--geopm-region-barrier"]),
    OptSpec::flag("preload", &["--geopm-preload"]),
    OptSpec::value("init_control", &["--geopm-init-control"]),
    OptSpec::value("report_signals", &["--geopm-report-signals"]),
    OptSpec::value("trace_signals", &["--geopm-trace-signals"]),
    OptSpec::flag("ht_disable", &["--geopm-hyperthreads-disable"]),
];

/// Whether `flag` is a GEOPM launcher option which takes a value. None
/// if it isn't a GEOPM option at all.
pub fn geopm_opt_takes_value(flag: &str) -> Option<bool> {
    GEOPM_OPTS
        .iter()
        .find(|spec| spec.names.contains(&flag))
        .map(|spec| spec.kind == OptKind::Value)
}

pub const HELP_GEOPM_OPTS: &str = "\
GEOPM options:
      --geopm-ctl=ctl         use geopm runtime and launch geopm with the
                              \"ctl\" method, one of \"process\", \"pthread\" or
                              \"application\" (default: process)
      --geopm-ctl-disable     do not launch the geopm controller
      --geopm-agent=agent     specify the agent to be used
      --geopm-policy=pol      use the geopm policy file \"pol\"
      --geopm-report=path     create geopm report file at \"path\"
      --geopm-trace=path      create geopm trace files with base name \"path\"
      --geopm-trace-profile=path
                              create profile trace files with base name \"path\"
      --geopm-profile=name    set the name of the profile in the report
      --geopm-shmkey=key      use shared memory keys prefixed with \"key\"
      --geopm-timeout=sec     application waits \"sec\" seconds for handshake
      --geopm-plugin-path=path
                              look for geopm plugins in \"path\"
      --geopm-debug-attach=rk attach serial debugger to rank \"rk\"
      --geopm-region-barrier  apply node local barriers at region boundaries
      --geopm-preload         use LD_PRELOAD to link libgeopm.so at runtime
      --geopm-init-control=path
                              apply the controls listed in \"path\" at startup
      --geopm-report-signals=sigs
                              extra signals to include in the report
      --geopm-trace-signals=sigs
                              extra signals to include in the trace
      --geopm-hyperthreads-disable
                              fail if ranks would need to share cores
";

/// GEOPM settings carried on the launcher command line. They never reach
/// the resource manager, they are translated into the child environment.
#[derive(Debug, Clone, Default)]
pub struct GeopmConfig {
    pub ctl: Option<CtlMode>,
    pub agent: Option<String>,
    pub policy: Option<String>,
    pub report: Option<String>,
    pub trace: Option<String>,
    pub trace_profile: Option<String>,
    pub profile: Option<String>,
    pub shmkey: Option<String>,
    pub timeout: Option<String>,
    pub plugin: Option<String>,
    pub debug_attach: Option<String>,
    pub barrier: bool,
    pub preload: bool,
    pub init_control: Option<String>,
    pub report_signals: Option<String>,
    pub trace_signals: Option<String>,
    pub hyperthreads_disabled: bool,
    pub omp_num_threads: Option<usize>,
}

impl GeopmConfig {
    /// Consume the GEOPM options in `argv`. Returns the config, None if
    /// the controller is disabled, and the remaining arguments.
    pub fn parse(argv: &[String]) -> Result<(Option<Self>, Vec<String>)> {
        let opts = parse_subset(GEOPM_OPTS, argv)?;

        if opts.flag("ctl_disable") {
            if opts.value("ctl").is_some() {
                config_bail!("--geopm-ctl and --geopm-ctl-disable are mutually exclusive");
            }
            return Ok((None, opts.unparsed));
        }

        let ctl = match opts.value("ctl") {
            Some(v) => CtlMode::parse(v)?,
            None => CtlMode::Process,
        };

        let config = Self {
            ctl: Some(ctl),
            agent: opts.owned("agent"),
            policy: opts.owned("policy"),
            report: opts.owned("report"),
            trace: opts.owned("trace"),
            trace_profile: opts.owned("trace_profile"),
            profile: opts.owned("profile"),
            shmkey: opts.owned("shmkey"),
            timeout: opts.owned("timeout"),
            plugin: opts.owned("plugin"),
            debug_attach: opts.owned("debug_attach"),
            barrier: opts.flag("barrier"),
            preload: opts.flag("preload"),
            init_control: opts.owned("init_control"),
            report_signals: opts.owned("report_signals"),
            trace_signals: opts.owned("trace_signals"),
            hyperthreads_disabled: opts.flag("ht_disable"),
            omp_num_threads: None,
        };
        Ok((Some(config), opts.unparsed))
    }

    pub fn ctl(&self) -> CtlMode {
        self.ctl.unwrap_or(CtlMode::Process)
    }

    /// Environment variables controlled by the config.
    pub fn environ(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::<String, String>::new();
        let mut set = |k: &str, v: &str| {
            env.insert(k.to_string(), v.to_string());
        };

        set("LD_DYNAMIC_WEAK", "true");
        set("OMP_PROC_BIND", "true");
        for (k, v) in AFFINITY_ENV.iter() {
            set(k, v);
        }
        match self.ctl() {
            CtlMode::Process | CtlMode::Pthread => set("GEOPM_CTL", self.ctl().as_str()),
            CtlMode::Application => {}
        }
        set("GEOPM_PROFILE", self.profile.as_deref().unwrap_or(""));

        for (key, val) in &[
            ("GEOPM_AGENT", &self.agent),
            ("GEOPM_POLICY", &self.policy),
            ("GEOPM_REPORT", &self.report),
            ("GEOPM_TRACE", &self.trace),
            ("GEOPM_TRACE_PROFILE", &self.trace_profile),
            ("GEOPM_SHMKEY", &self.shmkey),
            ("GEOPM_PROFILE_TIMEOUT", &self.timeout),
            ("GEOPM_PLUGIN_PATH", &self.plugin),
            ("GEOPM_DEBUG_ATTACH", &self.debug_attach),
            ("GEOPM_INIT_CONTROL", &self.init_control),
            ("GEOPM_REPORT_SIGNALS", &self.report_signals),
            ("GEOPM_TRACE_SIGNALS", &self.trace_signals),
        ] {
            if let Some(v) = val {
                set(key, v);
            }
        }

        if self.barrier {
            set("GEOPM_REGION_BARRIER", "true");
        }
        if self.preload {
            let preload = match env::var("LD_PRELOAD") {
                Ok(v) if !v.is_empty() => format!("libgeopm.so:{}", v),
                _ => "libgeopm.so".to_string(),
            };
            set("LD_PRELOAD", &preload);
        }
        if let Some(nr) = self.omp_num_threads {
            set("OMP_NUM_THREADS", &format!("{}", nr));
        }
        if let Some(libdir) = bundled_openmp_libdir() {
            let path = match env::var("LD_LIBRARY_PATH") {
                Ok(v) if !v.is_empty() => format!("{}:{}", libdir, v),
                _ => libdir,
            };
            set("LD_LIBRARY_PATH", &path);
        }
        env
    }
}

impl fmt::Display for GeopmConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pairs: Vec<String> = self
            .environ()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", pairs.join(" "))
    }
}

// An OpenMP runtime installed next to the binaries under
// PREFIX/lib*/geopm/openmp/lib. Only used if exactly one is found.
fn bundled_openmp_libdir() -> Option<String> {
    let prefix = exe_dir().ok()?.parent()?.to_path_buf();
    let pattern = format!("{}/lib*/geopm/openmp/lib", prefix.to_str()?);
    let found: Vec<_> = glob::glob(&pattern).ok()?.filter_map(|x| x.ok()).collect();
    match found.as_slice() {
        [dir] if Path::new(dir).is_dir() => {
            debug!("Using bundled OpenMP runtime in {:?}", dir);
            dir.to_str().map(|x| x.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_geopm_config_parse() {
        let argv = strs(&[
            "-N",
            "2",
            "--geopm-ctl=pthread",
            "--geopm-report",
            "r.report",
            "--geopm-region-barrier",
            "--geopm-agent=power_governor",
            "--",
            "app",
            "--geopm-ignored",
        ]);
        let (config, rest) = GeopmConfig::parse(&argv).unwrap();
        let config = config.unwrap();
        assert_eq!(config.ctl(), CtlMode::Pthread);
        assert_eq!(config.report.as_deref(), Some("r.report"));
        assert!(config.barrier);
        assert_eq!(rest, strs(&["-N", "2", "--", "app", "--geopm-ignored"]));

        let env = config.environ();
        assert_eq!(env["GEOPM_CTL"], "pthread");
        assert_eq!(env["GEOPM_REPORT"], "r.report");
        assert_eq!(env["GEOPM_AGENT"], "power_governor");
        assert_eq!(env["GEOPM_REGION_BARRIER"], "true");
        assert_eq!(env["GEOPM_PROFILE"], "");
        assert_eq!(env["KMP_AFFINITY"], "disabled");
        assert_eq!(env["MV2_ENABLE_AFFINITY"], "0");
        assert!(!env.contains_key("GEOPM_POLICY"));
    }

    #[test]
    fn test_geopm_config_disable() {
        let (config, rest) =
            GeopmConfig::parse(&strs(&["--geopm-ctl-disable", "-n", "1", "--", "lscpu"])).unwrap();
        assert!(config.is_none());
        assert_eq!(rest, strs(&["-n", "1", "--", "lscpu"]));

        assert!(GeopmConfig::parse(&strs(&["--geopm-ctl-disable", "--geopm-ctl", "process"])).is_err());
        assert!(GeopmConfig::parse(&strs(&["--geopm-ctl", "thread"])).is_err());
    }

    #[test]
    fn test_geopm_config_application_env() {
        let (config, _) = GeopmConfig::parse(&strs(&["--geopm-ctl", "application"])).unwrap();
        let mut config = config.unwrap();
        config.omp_num_threads = Some(4);
        let env = config.environ();
        assert!(!env.contains_key("GEOPM_CTL"));
        assert_eq!(env["OMP_NUM_THREADS"], "4");
        let echo = format!("{}", config);
        assert!(echo.contains("OMP_NUM_THREADS=4"));
        assert!(echo.contains("LD_DYNAMIC_WEAK=true"));
    }

    #[test]
    fn test_geopm_opt_takes_value() {
        for (flag, expected) in &[
            ("--geopm-report", Some(true)),
            ("--geopm-ctl-disable", Some(false)),
            ("--geopm-region-barrier", Some(false)),
            ("--geopm-trace-signals", Some(true)),
            ("--ntasks", None),
        ] {
            println!("{} -> {:?}", flag, geopm_opt_takes_value(flag));
            assert_eq!(geopm_opt_takes_value(flag), *expected);
        }
    }
}
