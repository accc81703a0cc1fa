// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
//
// Wraps srun, aprun and mpiexec.hydra so that GEOPM controller placement,
// CPU pinning and the GEOPM environment are derived from a single
// launcher command line.
use anyhow::Result;
use geopm_util::ExpError;
use log::{debug, warn};
use std::env;
use std::process::{Command, Stdio};

mod config;
mod launcher;
mod subset;
mod topo;

pub use config::{geopm_opt_takes_value, CtlMode, GeopmConfig, HELP_GEOPM_OPTS};
pub use launcher::{LaunchOverrides, Launcher, NodeQuery, ResourceManager, SystemQuery};
pub use topo::{affinity_list, cpu_mask_hex, AffinityRequest, CpuSet, Topology};

const HOSTNAME_PREFIXES: &[(&str, ResourceManager)] = &[
    ("mr-fusion", ResourceManager::Slurm),
    ("theta", ResourceManager::Alps),
    ("quartz", ResourceManager::SlurmToss),
    ("ruby", ResourceManager::SlurmToss),
];

/// Launcher names accepted as the first argument of geopmlaunch.
pub fn launcher_arg(arg: &str) -> Option<ResourceManager> {
    match arg {
        "srun" => Some(ResourceManager::Slurm),
        "srun_toss" => Some(ResourceManager::SlurmToss),
        "aprun" => Some(ResourceManager::Alps),
        "impi" => Some(ResourceManager::Impi),
        _ => None,
    }
}

fn lookup(name: &str, source: &str) -> Result<ResourceManager> {
    ResourceManager::from_name(name)
        .ok_or_else(|| ExpError::lookup(format!("Unrecognized resource manager {:?} from {}", name, source)))
}

/// Pick the resource manager. The first of these wins: explicit override,
/// `env_rm` (GEOPM_RM), a launcher name given as the first argument, the
/// program name, the host name and finally whichever of srun and aprun
/// `runnable` accepts.
pub fn detect_resource_manager(
    rm_override: Option<&str>,
    env_rm: Option<&str>,
    launcher_name: Option<&str>,
    argv0: &str,
    hostname: &str,
    runnable: &mut dyn FnMut(&str) -> bool,
) -> Result<ResourceManager> {
    if let Some(name) = rm_override {
        return lookup(name, "override");
    }
    if let Some(name) = env_rm.filter(|v| !v.is_empty()) {
        return lookup(name, "GEOPM_RM");
    }
    if let Some(rm) = launcher_name.and_then(launcher_arg) {
        return Ok(rm);
    }
    if argv0.ends_with("aprun") {
        return Ok(ResourceManager::Alps);
    }
    if argv0.ends_with("srun") {
        return Ok(ResourceManager::Slurm);
    }
    for (prefix, rm) in HOSTNAME_PREFIXES.iter() {
        if hostname.starts_with(prefix) {
            debug!("launcher: {:?} selected from host name {:?}", rm, hostname);
            return Ok(*rm);
        }
    }
    for rm in &[ResourceManager::Slurm, ResourceManager::Alps] {
        if runnable(rm.exec()) {
            warn!(
                "Resource manager not specified, {} found in PATH, assuming {}",
                rm.exec(),
                rm.name()
            );
            return Ok(*rm);
        }
    }
    Err(ExpError::lookup(
        "Unable to determine resource manager, set GEOPM_RM or name the launcher explicitly",
    ))
}

fn version_runs(exec: &str) -> bool {
    Command::new(exec)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|st| st.success())
        .unwrap_or(false)
}

/// Resource manager detection against the live system.
pub fn resource_manager(
    rm_override: Option<&str>,
    launcher_name: Option<&str>,
    argv0: &str,
) -> Result<ResourceManager> {
    let env_rm = env::var("GEOPM_RM").ok();
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    detect_resource_manager(
        rm_override,
        env_rm.as_deref(),
        launcher_name,
        argv0,
        &host,
        &mut version_runs,
    )
}

/// Build a launcher from a full command line, program name first. A
/// launcher name in `argv[1]` is consumed.
pub fn factory(argv: &[String], rm_override: Option<&str>, ovr: LaunchOverrides) -> Result<Launcher> {
    let argv0 = argv.first().map(|x| x.as_str()).unwrap_or("");
    let mut rest = argv.get(1..).unwrap_or(&[]);
    let launcher_name = rest.first().map(|x| x.as_str()).filter(|x| launcher_arg(x).is_some());
    if launcher_name.is_some() {
        rest = &rest[1..];
    }
    let rm = resource_manager(rm_override, launcher_name, argv0)?;
    Launcher::new(rm, rest, ovr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_resource_manager() {
        use ResourceManager::*;
        for (ovr, env_rm, name, argv0, host, expected) in &[
            (Some("IMPI"), Some("ALPS"), Some("srun"), "geopmlaunch", "theta1", Impi),
            (None, Some("SLURM_TOSS"), Some("aprun"), "geopmlaunch", "", SlurmToss),
            (None, None, Some("aprun"), "geopmlaunch", "mr-fusion3", Alps),
            (None, Some(""), None, "/usr/bin/geopmsrun", "theta1", Slurm),
            (None, None, None, "geopmaprun", "", Alps),
            (None, None, None, "geopmlaunch", "mr-fusion3", Slurm),
            (None, None, None, "geopmlaunch", "theta12", Alps),
            (None, None, None, "geopmlaunch", "quartz7", SlurmToss),
            (None, None, None, "geopmlaunch", "ruby100", SlurmToss),
        ] {
            let rm = detect_resource_manager(*ovr, *env_rm, *name, argv0, host, &mut |_| false).unwrap();
            println!("{:?} {:?} {:?} {} {} -> {:?}", ovr, env_rm, name, argv0, host, rm);
            assert_eq!(rm, *expected);
        }
    }

    #[test]
    fn test_detect_resource_manager_path_search() {
        let mut searched = vec![];
        let rm = detect_resource_manager(None, None, None, "geopmlaunch", "node1", &mut |exec| {
            searched.push(exec.to_string());
            exec == "aprun"
        })
        .unwrap();
        assert_eq!(rm, ResourceManager::Alps);
        assert_eq!(searched, vec!["srun".to_string(), "aprun".to_string()]);

        let err = detect_resource_manager(None, None, None, "geopmlaunch", "node1", &mut |_| false).unwrap_err();
        assert!(matches!(err.downcast_ref::<ExpError>(), Some(ExpError::Lookup(_))));

        let err = detect_resource_manager(None, Some("PBS"), None, "", "", &mut |_| true).unwrap_err();
        assert!(matches!(err.downcast_ref::<ExpError>(), Some(ExpError::Lookup(_))));
    }
}
