// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::str::FromStr;

use super::app::AppConf;
use geopm_exp_intf::{Args, MachineRecord};
use geopm_util::*;

mod arithmetic_intensity;
mod geopmbench;
mod hpcg;
mod minife;
mod parres;

pub use arithmetic_intensity::ArithmeticIntensity;
pub use geopmbench::{BenchConf, GeopmBench};
pub use hpcg::Hpcg;
pub use minife::MiniFe;
pub use parres::{Parres, ParresKernel};

pub const APP_NAMES: &[&str] = &[
    "geopmbench",
    "arithmetic_intensity",
    "parres-dgemm",
    "parres-nstream",
    "hpcg",
    "minife",
];

/// Typed view of `--app-opt`. Every key must be consumed by the
/// adapter, leftovers are reported by `finish()`.
pub struct AppOpts<'a> {
    app: &'a str,
    opts: BTreeMap<&'a str, &'a str>,
}

impl<'a> AppOpts<'a> {
    pub fn new(app: &'a str, opts: &'a BTreeMap<String, String>) -> Self {
        Self {
            app,
            opts: opts.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
        }
    }

    pub fn take_str(&mut self, key: &str) -> Option<String> {
        self.opts.remove(key).map(|v| v.to_string())
    }

    pub fn take<T>(&mut self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
    {
        match self.opts.remove(key) {
            Some(v) => match v.parse::<T>() {
                Ok(v) => Ok(Some(v)),
                Err(_) => config_bail!("{}: invalid value {:?} for {:?}", self.app, v, key),
            },
            None => Ok(None),
        }
    }

    pub fn finish(self) -> Result<()> {
        if !self.opts.is_empty() {
            let keys: Vec<&str> = self.opts.keys().cloned().collect();
            config_bail!("{}: unknown application options {:?}", self.app, keys);
        }
        Ok(())
    }
}

/// Directory holding the benchmark builds. `app-dir` wins over
/// `GEOPM_APPS_DIR`, the executable's directory is the last resort.
pub fn apps_dir(opts: &mut AppOpts) -> Result<PathBuf> {
    if let Some(v) = opts.take_str("app-dir") {
        return Ok(PathBuf::from(v));
    }
    if let Some(v) = env::var_os("GEOPM_APPS_DIR") {
        return Ok(PathBuf::from(v));
    }
    exe_dir()
}

/// Locate `name` under `dir` or in PATH, falling back to the bare
/// path under `dir` so that the failure shows up at launch time.
pub fn resolve_exec(dir: &Path, name: &str) -> PathBuf {
    match find_bin(name, Some(dir)) {
        Some(v) => v,
        None => dir.join(name),
    }
}

/// Per-run scratch directory `<output_dir>/<run_id>`.
pub fn stage_run_dir(run_id: &str, output_dir: &Path) -> Result<PathBuf> {
    let dir = output_dir.join(run_id);
    fs::create_dir_all(&dir).with_context(|| format!("Creating {:?}", &dir))?;
    Ok(dir)
}

/// Run a user provided setup or teardown script on the head node.
pub fn run_hook_script(script: &Path) -> Result<()> {
    set_executable(script)?;
    run_command(&mut Command::new(script), "hook script failed")
}

pub fn remove_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) => warn!("Failed to remove {:?} ({})", path, &e),
    }
}

pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

pub fn create_app(args: &Args, mach: &MachineRecord) -> Result<Rc<dyn AppConf>> {
    let mut opts = AppOpts::new(&args.app, &args.app_opts);
    let app: Rc<dyn AppConf> = match args.app.as_str() {
        "geopmbench" => Rc::new(GeopmBench::new(&mut opts, mach)?),
        "arithmetic_intensity" => Rc::new(ArithmeticIntensity::new(&mut opts, mach)?),
        "parres-dgemm" => {
            Rc::new(Parres::new(ParresKernel::Dgemm, &mut opts, mach, args.node_count)?)
        }
        "parres-nstream" => {
            Rc::new(Parres::new(ParresKernel::Nstream, &mut opts, mach, args.node_count)?)
        }
        "hpcg" => Rc::new(Hpcg::new(&mut opts, mach)?),
        "minife" => Rc::new(MiniFe::new(&mut opts, mach, args.node_count)?),
        name => config_bail!("unknown application {:?}, expected one of {:?}", name, APP_NAMES),
    };
    opts.finish()?;
    Ok(app)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn test_machine() -> MachineRecord {
        let mut mach = MachineRecord::default();
        mach.num_core = Some(40.0);
        mach.num_package = Some(2.0);
        mach.num_gpu = Some(4.0);
        mach
    }

    #[test]
    fn test_shell_quote() {
        for (input, expected) in &[
            ("plain", "plain"),
            ("--nx=104", "--nx=104"),
            ("two words", "'two words'"),
            ("it's", "'it'\\''s'"),
            ("", "''"),
        ] {
            let quoted = shell_quote(input);
            println!("{:?} -> {}", input, &quoted);
            assert_eq!(&quoted, expected);
        }
    }

    #[test]
    fn test_create_app_options() {
        let mach = test_machine();
        for (app, opts, ok) in &[
            ("geopmbench", "loop-count=5", true),
            ("hpcg", "nx=32,ny=32,nz=32", true),
            ("hpcg", "nx=big", false),
            ("minife", "bogus=1", false),
            ("parres-dgemm", "", true),
            ("no-such-app", "", false),
        ] {
            let mut args = Args::default();
            args.app = app.to_string();
            args.app_opts = Args::parse_propset(opts);
            let res = create_app(&args, &mach);
            println!("{} {:?} -> {:?}", app, opts, res.as_ref().map(|a| a.name().to_string()));
            assert_eq!(res.is_ok(), *ok);
            if let Err(e) = res {
                assert!(e.downcast_ref::<ExpError>().is_some());
            }
        }
    }
}
