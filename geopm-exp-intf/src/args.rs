// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use geopm_util::*;

lazy_static::lazy_static! {
    static ref TOP_ARGS_STR: String = {
        let dfl_args = Args::default();
        format!(
            "-o, --output-dir=[DIR]             'Directory for all run artifacts (dfl: {dfl_dir})'
             -N, --node-count=[NR]              'Number of compute nodes (dfl: {dfl_nodes})'
             -t, --trial-count=[NR]             'Number of trials per configuration (dfl: {dfl_trials})'
                 --cool-off-time=[SECS]         'Idle time between runs (dfl: {dfl_cool_off})'
                 --enable-traces                'Generate a trace per run'
                 --disable-traces               'Do not generate traces'
                 --enable-profile-traces        'Generate a profile trace per run'
                 --disable-profile-traces       'Do not generate profile traces'
                 --app=[NAME]                   'Application to run (dfl: {dfl_app})'
                 --app-opt=[PROPS]              'Application options, KEY=VAL[,KEY=VAL...]'
                 --min-power=[WATTS]            'Lowest power cap in the sweep'
                 --max-power=[WATTS]            'Highest power cap in the sweep'
                 --step-power=[WATTS]           'Power cap step (dfl: {dfl_step_power})'
                 --min-frequency=[HZ]           'Lowest core frequency in the sweep'
                 --max-frequency=[HZ]           'Highest core frequency in the sweep'
                 --step-frequency=[HZ]          'Core frequency step'
                 --min-uncore-frequency=[HZ]    'Lowest uncore frequency in the sweep'
                 --max-uncore-frequency=[HZ]    'Highest uncore frequency in the sweep'
                 --step-uncore-frequency=[HZ]   'Uncore frequency step'
                 --min-gpu-frequency=[HZ]       'Lowest GPU frequency in the sweep'
                 --max-gpu-frequency=[HZ]       'Highest GPU frequency in the sweep'
                 --step-gpu-frequency=[HZ]      'GPU frequency step'
                 --agent-list=[AGENTS]          'Comma separated power agents (dfl: {dfl_agents})'
                 --run-max-turbo                'Add the maximum turbo frequency to frequency sweeps'
                 --init-control=[PATH]          'Init-control file applied before each run'
                 --phi-list=[PHIS]              'Phi values in [0, 1] separated by spaces or commas'
                 --tuned-config=[PATH]          'Tuned configuration providing efficient frequencies for phi sweeps'
             -a, --args=[FILE]                  'Loads base command line arguments from FILE'
             -v...                              'Sets the level of verbosity'",
            dfl_dir = dfl_args.output_dir,
            dfl_nodes = dfl_args.node_count,
            dfl_trials = dfl_args.trial_count,
            dfl_cool_off = format_duration(dfl_args.cool_off_time),
            dfl_app = dfl_args.app,
            dfl_step_power = dfl_args.step_power.unwrap_or(0.0),
            dfl_agents = dfl_args.agent_list.join(","),
        )
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mode {
    Frequency,
    UncoreFrequency,
    GpuFrequency,
    CombinedFrequency,
    Power,
    CpuPhi,
    GpuPhi,
    EndpointPhi,
    Monitor,
    CharacterizeCpu,
    CharacterizeGpu,
    Analyze,
}

impl Mode {
    pub fn launches(&self) -> bool {
        *self != Mode::Analyze
    }
}

const MODE_CMDS: &[(&str, Mode, &str)] = &[
    ("frequency", Mode::Frequency, "Sweeps the core frequency"),
    ("uncore-frequency", Mode::UncoreFrequency, "Sweeps the uncore frequency"),
    ("gpu-frequency", Mode::GpuFrequency, "Sweeps the GPU frequency"),
    (
        "combined-frequency",
        Mode::CombinedFrequency,
        "Sweeps core, uncore and GPU frequencies together",
    ),
    ("power", Mode::Power, "Sweeps the package power cap for each agent in --agent-list"),
    ("cpu-phi", Mode::CpuPhi, "Sweeps phi of the CPU activity agent"),
    ("gpu-phi", Mode::GpuPhi, "Sweeps phi of the GPU activity agent"),
    (
        "endpoint-phi",
        Mode::EndpointPhi,
        "Sweeps phi of the CPU activity agent through its endpoint policy",
    ),
    ("monitor", Mode::Monitor, "Runs the application under the monitor agent"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub output_dir: String,
    pub node_count: usize,
    pub trial_count: usize,
    pub cool_off_time: f64,
    pub enable_traces: bool,
    pub enable_profile_traces: bool,
    pub app: String,
    pub app_opts: BTreeMap<String, String>,
    pub min_power: Option<f64>,
    pub max_power: Option<f64>,
    pub step_power: Option<f64>,
    pub min_frequency: Option<f64>,
    pub max_frequency: Option<f64>,
    pub step_frequency: Option<f64>,
    pub min_uncore_frequency: Option<f64>,
    pub max_uncore_frequency: Option<f64>,
    pub step_uncore_frequency: Option<f64>,
    pub min_gpu_frequency: Option<f64>,
    pub max_gpu_frequency: Option<f64>,
    pub step_gpu_frequency: Option<f64>,
    pub agent_list: Vec<String>,
    pub run_max_turbo: bool,
    pub init_control: Option<String>,
    pub phi_list: Option<Vec<f64>>,
    pub tuned_config: Option<String>,
    pub mode: Mode,

    #[serde(skip)]
    pub extra_args: Vec<String>,
    #[serde(skip)]
    pub mem_region: String,
    #[serde(skip)]
    pub compute_region: String,
    #[serde(skip)]
    pub gpu_region: String,
    #[serde(skip)]
    pub core_energy_margin: f64,
    #[serde(skip)]
    pub uncore_energy_margin: f64,
    #[serde(skip)]
    pub gpu_energy_margin: f64,
    #[serde(skip)]
    pub merge_config: Option<String>,
    #[serde(skip)]
    pub report_glob: String,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            output_dir: ".".into(),
            node_count: 1,
            trial_count: 2,
            cool_off_time: 60.0,
            enable_traces: false,
            enable_profile_traces: false,
            app: "geopmbench".into(),
            app_opts: Default::default(),
            min_power: None,
            max_power: None,
            step_power: Some(10.0),
            min_frequency: None,
            max_frequency: None,
            step_frequency: None,
            min_uncore_frequency: None,
            max_uncore_frequency: None,
            step_uncore_frequency: None,
            min_gpu_frequency: None,
            max_gpu_frequency: None,
            step_gpu_frequency: None,
            agent_list: vec!["power_governor".into(), "power_balancer".into()],
            run_max_turbo: false,
            init_control: None,
            phi_list: None,
            tuned_config: None,
            mode: Mode::Monitor,
            extra_args: vec![],
            mem_region: Self::DFL_MEM_REGION.into(),
            compute_region: Self::DFL_COMPUTE_REGION.into(),
            gpu_region: Self::DFL_GPU_REGION.into(),
            core_energy_margin: 0.0,
            uncore_energy_margin: 0.0,
            gpu_energy_margin: 0.0,
            merge_config: None,
            report_glob: "*.report".into(),
            verbosity: 0,
        }
    }
}

fn parse_opt_f64(v: &str, what: &str) -> Result<Option<f64>> {
    if v.len() == 0 {
        return Ok(None);
    }
    Ok(Some(v.parse::<f64>().with_context(|| format!("Parsing --{} {:?}", what, v))?))
}

fn parse_count(v: &str, what: &str) -> Result<usize> {
    let nr = v
        .parse::<usize>()
        .with_context(|| format!("Parsing --{} {:?}", what, v))?;
    if nr == 0 {
        config_bail!("--{} must be positive", what);
    }
    Ok(nr)
}

impl Args {
    pub const DFL_MEM_REGION: &'static str = "intensity_1";
    pub const DFL_COMPUTE_REGION: &'static str = "intensity_16";
    pub const DFL_GPU_REGION: &'static str = "dgemm";

    pub fn parse_propset(input: &str) -> BTreeMap<String, String> {
        let mut propset = BTreeMap::<String, String>::new();
        for tok in input.split(',') {
            if tok.len() == 0 {
                continue;
            }

            // Allow key-only properties.
            let mut kv = tok.splitn(2, '=').collect::<Vec<&str>>();
            while kv.len() < 2 {
                kv.push("");
            }

            propset.insert(kv[0].into(), kv[1].into());
        }
        propset
    }

    pub fn parse_phi_list(input: &str) -> Result<Vec<f64>> {
        let phis = parse_f64_list(input)?;
        for phi in phis.iter() {
            if !(0.0..=1.0).contains(phi) {
                config_bail!("phi {} is outside [0, 1]", phi);
            }
        }
        Ok(phis)
    }

    fn characterize_gpu_cmd() -> clap::App<'static, 'static> {
        clap::SubCommand::with_name("characterize-gpu")
            .about("Runs a GPU frequency sweep and emits a tuned configuration")
            .args_from_usage(
                "--gpu-region=[REGION]           'Characterized region (dfl: dgemm)'
                 --gpu-energy-margin=[FRAC]      'Extra energy accepted for a lower GPU frequency'
                 --merge-config=[PATH]           'Merge the result into this tuned configuration'",
            )
            .arg(Self::extra_arg())
    }

    fn extra_arg() -> clap::Arg<'static, 'static> {
        clap::Arg::with_name("EXTRA")
            .multiple(true)
            .last(true)
            .help("Extra arguments passed through to the launcher, after --")
    }

    fn process_subcommand(&mut self, subm: &clap::ArgMatches) -> Result<()> {
        self.extra_args = subm
            .values_of("EXTRA")
            .map(|vals| vals.map(|x| x.to_string()).collect())
            .unwrap_or_default();

        match self.mode {
            Mode::CharacterizeCpu => {
                if let Some(v) = subm.value_of("mem-region") {
                    self.mem_region = v.into();
                }
                if let Some(v) = subm.value_of("compute-region") {
                    self.compute_region = v.into();
                }
                if let Some(v) = subm.value_of("core-energy-margin") {
                    self.core_energy_margin = parse_opt_f64(v, "core-energy-margin")?.unwrap_or(0.0);
                }
                if let Some(v) = subm.value_of("uncore-energy-margin") {
                    self.uncore_energy_margin =
                        parse_opt_f64(v, "uncore-energy-margin")?.unwrap_or(0.0);
                }
                self.merge_config = subm.value_of("merge-config").map(|x| x.to_string());
            }
            Mode::CharacterizeGpu => {
                if let Some(v) = subm.value_of("gpu-region") {
                    self.gpu_region = v.into();
                }
                if let Some(v) = subm.value_of("gpu-energy-margin") {
                    self.gpu_energy_margin = parse_opt_f64(v, "gpu-energy-margin")?.unwrap_or(0.0);
                }
                self.merge_config = subm.value_of("merge-config").map(|x| x.to_string());
            }
            Mode::Analyze => {
                if let Some(v) = subm.value_of("reports") {
                    self.report_glob = v.into();
                }
            }
            _ => {}
        }

        if self.core_energy_margin < 0.0
            || self.uncore_energy_margin < 0.0
            || self.gpu_energy_margin < 0.0
        {
            config_bail!("energy margins must not be negative");
        }
        Ok(())
    }
}

impl JsonLoad for Args {}
impl JsonSave for Args {}

impl JsonArgs for Args {
    #[allow(dangerous_implicit_autorefs)]
    fn match_cmdline() -> clap::ArgMatches<'static> {
        let mut app = clap::App::new("geopm-exp")
            .version((*super::FULL_VERSION).as_str())
            .author(clap::crate_authors!("\n"))
            .about("Runs applications under GEOPM across parameter sweeps and analyzes the results")
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .setting(clap::AppSettings::SubcommandRequiredElseHelp)
            .args_from_usage(&TOP_ARGS_STR);

        for (name, _, about) in MODE_CMDS.iter() {
            app = app.subcommand(
                clap::SubCommand::with_name(name)
                    .about(*about)
                    .arg(Self::extra_arg()),
            );
        }

        app.subcommand(
            clap::SubCommand::with_name("characterize-cpu")
                .about("Runs uncore then core frequency sweeps and emits a tuned configuration")
                .args_from_usage(
                    "--mem-region=[REGION]           'Memory bound region (dfl: intensity_1)'
                     --compute-region=[REGION]       'Compute bound region (dfl: intensity_16)'
                     --core-energy-margin=[FRAC]     'Extra energy accepted for a lower core frequency'
                     --uncore-energy-margin=[FRAC]   'Extra energy accepted for a lower uncore frequency'
                     --merge-config=[PATH]           'Merge the result into this tuned configuration'",
                )
                .arg(Self::extra_arg()),
        )
        .subcommand(Self::characterize_gpu_cmd())
        .subcommand(
            clap::SubCommand::with_name("analyze")
                .about("Summarizes the reports in the output directory")
                .args_from_usage("--reports=[GLOB]   'Report file pattern (dfl: *.report)'"),
        )
        .get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        let dfl = Args::default();
        let mut updated = false;

        if let Some(v) = matches.value_of("output-dir") {
            self.output_dir = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.output_dir.clone()
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("node-count") {
            self.node_count = if v.len() > 0 {
                parse_count(v, "node-count")?
            } else {
                dfl.node_count
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("trial-count") {
            self.trial_count = if v.len() > 0 {
                parse_count(v, "trial-count")?
            } else {
                dfl.trial_count
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("cool-off-time") {
            self.cool_off_time = if v.len() > 0 {
                parse_duration(v)?
            } else {
                dfl.cool_off_time
            };
            if self.cool_off_time < 0.0 {
                config_bail!("--cool-off-time must not be negative");
            }
            updated = true;
        }
        if matches.is_present("enable-traces") {
            self.enable_traces = true;
            updated = true;
        }
        if matches.is_present("disable-traces") {
            self.enable_traces = false;
            updated = true;
        }
        if matches.is_present("enable-profile-traces") {
            self.enable_profile_traces = true;
            updated = true;
        }
        if matches.is_present("disable-profile-traces") {
            self.enable_profile_traces = false;
            updated = true;
        }
        if let Some(v) = matches.value_of("app") {
            self.app = if v.len() > 0 { v.to_string() } else { dfl.app.clone() };
            updated = true;
        }
        if let Some(v) = matches.value_of("app-opt") {
            self.app_opts = Self::parse_propset(v);
            updated = true;
        }

        for (name, slot) in vec![
            ("min-power", &mut self.min_power),
            ("max-power", &mut self.max_power),
            ("min-frequency", &mut self.min_frequency),
            ("max-frequency", &mut self.max_frequency),
            ("step-frequency", &mut self.step_frequency),
            ("min-uncore-frequency", &mut self.min_uncore_frequency),
            ("max-uncore-frequency", &mut self.max_uncore_frequency),
            ("step-uncore-frequency", &mut self.step_uncore_frequency),
            ("min-gpu-frequency", &mut self.min_gpu_frequency),
            ("max-gpu-frequency", &mut self.max_gpu_frequency),
            ("step-gpu-frequency", &mut self.step_gpu_frequency),
        ] {
            if let Some(v) = matches.value_of(name) {
                *slot = parse_opt_f64(v, name)?;
                updated = true;
            }
        }
        if let Some(v) = matches.value_of("step-power") {
            self.step_power = match parse_opt_f64(v, "step-power")? {
                Some(v) => Some(v),
                None => dfl.step_power,
            };
            updated = true;
        }

        if let Some(v) = matches.value_of("agent-list") {
            self.agent_list = if v.len() > 0 {
                v.split(',')
                    .map(|x| x.trim().to_string())
                    .filter(|x| x.len() > 0)
                    .collect()
            } else {
                dfl.agent_list.clone()
            };
            updated = true;
        }
        if matches.is_present("run-max-turbo") {
            self.run_max_turbo = true;
            updated = true;
        }
        if let Some(v) = matches.value_of("init-control") {
            self.init_control = if v.len() > 0 { Some(v.to_string()) } else { None };
            updated = true;
        }
        if let Some(v) = matches.value_of("phi-list") {
            self.phi_list = if v.len() > 0 {
                Some(Self::parse_phi_list(v)?)
            } else {
                None
            };
            updated = true;
        }
        if let Some(v) = matches.value_of("tuned-config") {
            self.tuned_config = if v.len() > 0 { Some(v.to_string()) } else { None };
            updated = true;
        }

        self.verbosity = Self::verbosity(matches);

        let (cmd, subm) = matches.subcommand();
        let mode = match cmd {
            "characterize-cpu" => Mode::CharacterizeCpu,
            "characterize-gpu" => Mode::CharacterizeGpu,
            "analyze" => Mode::Analyze,
            cmd => match MODE_CMDS.iter().find(|(name, _, _)| *name == cmd) {
                Some((_, mode, _)) => *mode,
                None => config_bail!("unknown subcommand {:?}", cmd),
            },
        };
        if self.mode != mode {
            self.mode = mode;
            updated = true;
        }
        if let Some(subm) = subm {
            self.process_subcommand(subm)?;
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_propset() {
        for (input, expected) in &[
            ("", vec![]),
            ("iterations=5", vec![("iterations", "5")]),
            ("a=1,,b,c=x=y", vec![("a", "1"), ("b", ""), ("c", "x=y")]),
        ] {
            let propset = Args::parse_propset(input);
            println!("{:?} -> {:?}", input, &propset);
            let expected: BTreeMap<String, String> = expected
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            assert_eq!(propset, expected);
        }
    }

    #[test]
    fn test_parse_phi_list() {
        assert_eq!(Args::parse_phi_list("0 0.5 1").unwrap(), vec![0.0, 0.5, 1.0]);
        assert_eq!(Args::parse_phi_list("0.2,0.3").unwrap(), vec![0.2, 0.3]);
        assert!(Args::parse_phi_list("0.5 1.5").is_err());
        assert!(Args::parse_phi_list("x").is_err());
    }

    #[test]
    fn test_gpu_energy_margin() {
        for (argv, gpu, core) in &[
            (vec!["characterize-gpu"], 0.0, 0.0),
            (vec!["characterize-gpu", "--gpu-energy-margin=0.1"], 0.1, 0.0),
            (vec!["characterize-gpu", "--gpu-energy-margin", "0.05", "--gpu-region=stream"], 0.05, 0.0),
        ] {
            let mut args = Args::default();
            args.mode = Mode::CharacterizeGpu;
            let subm = Args::characterize_gpu_cmd().get_matches_from(argv.clone());
            args.process_subcommand(&subm).unwrap();
            println!("{:?} -> gpu={} core={}", argv, args.gpu_energy_margin, args.core_energy_margin);
            assert_eq!(args.gpu_energy_margin, *gpu);
            assert_eq!(args.core_energy_margin, *core);
        }
    }

    #[test]
    fn test_args_file_round_trip_skips_transients() {
        let mut args = Args::default();
        args.mode = Mode::Power;
        args.extra_args = vec!["--geopm-timeout=30".into()];
        let json = args.as_json().unwrap();
        assert!(!json.contains("extra_args"));
        let parsed: Args = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.mode, Mode::Power);
        assert!(parsed.extra_args.is_empty());
        assert_eq!(parsed.mem_region, Args::DFL_MEM_REGION);
    }
}
