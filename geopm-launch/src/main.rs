// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use log::error;
use std::env;
use std::io;
use std::process::{exit, Command};

use geopm_launch::{factory, launcher_arg, resource_manager, LaunchOverrides, HELP_GEOPM_OPTS};
use geopm_util::{full_version, init_logging};

fn print_help(args: &[String]) -> Result<()> {
    let argv0 = args.first().map(|x| x.as_str()).unwrap_or("");
    let name = args.get(1).map(|x| x.as_str()).filter(|x| launcher_arg(x).is_some());
    match resource_manager(None, name, argv0) {
        Ok(rm) => {
            // The launcher's own usage goes first. Not having it installed
            // shouldn't hide ours.
            let _ = Command::new(rm.exec()).arg("--help").status();
        }
        Err(e) => error!("{:#}", &e),
    }
    println!("{}", HELP_GEOPM_OPTS);
    Ok(())
}

fn run(args: Vec<String>) -> Result<()> {
    let opts: Vec<&str> = args
        .iter()
        .skip(1)
        .map(|x| x.as_str())
        .take_while(|x| *x != "--")
        .collect();

    if opts.iter().any(|x| *x == "--help" || *x == "-h") {
        return print_help(&args);
    }
    if opts.iter().any(|x| *x == "--version") {
        println!("geopmlaunch {}", full_version(env!("CARGO_PKG_VERSION")));
        return Ok(());
    }

    let mut launcher = factory(&args, None, LaunchOverrides::default())?;
    let stdout = io::stdout();
    let stderr = io::stderr();
    launcher.run(&mut stdout.lock(), &mut stderr.lock())
}

fn main() {
    init_logging(0);
    if let Err(e) = run(env::args().collect()) {
        error!("{:#}", &e);
        exit(1);
    }
}
