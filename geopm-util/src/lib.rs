// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use crossbeam::channel::Sender;
use log::{info, warn};
use simplelog as sl;
use std::collections::BTreeSet;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt::Write as FmtWrite;
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Condvar, Mutex, Once};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub mod error;
pub mod json_file;

pub use error::ExpError;
pub use json_file::{JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonRawFile, JsonSave};

pub const TO_PCT: f64 = 100.0;

pub fn full_version(semver: &str) -> String {
    let mut ver = semver.to_string();
    if let Some(sha) = option_env!("VERGEN_GIT_SHA") {
        if sha.len() >= 7 && sha.chars().all(|c| c.is_ascii_hexdigit()) {
            write!(ver, "-{}", &sha[0..7]).unwrap();
        }
    }
    if let Some(triple) = option_env!("VERGEN_CARGO_TARGET_TRIPLE") {
        write!(ver, " {}", triple).unwrap();
    }
    ver
}

pub fn int_ceil_div(a: usize, b: usize) -> usize {
    if b == 0 {
        return 0;
    }
    (a + b - 1) / b
}

/// Compact form of an integer set, e.g. {1, 2, 3, 5, 7, 9, 10} becomes
/// "1-3,5,7,9-10".
pub fn range_str<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a usize>,
{
    let sorted: BTreeSet<usize> = values.into_iter().cloned().collect();
    let mut groups: Vec<(usize, usize)> = vec![];
    for v in sorted {
        match groups.last_mut() {
            Some(last) if last.1 + 1 == v => last.1 = v,
            _ => groups.push((v, v)),
        }
    }
    groups
        .iter()
        .map(|(begin, end)| {
            if begin == end {
                format!("{}", begin)
            } else {
                format!("{}-{}", begin, end)
            }
        })
        .collect::<Vec<String>>()
        .join(",")
}

pub fn parse_f64_list(input: &str) -> Result<Vec<f64>> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|x| !x.is_empty())
        .map(|x| {
            x.parse::<f64>()
                .with_context(|| format!("failed to parse {:?} as a number", x))
        })
        .collect()
}

pub fn format_duration(dur: f64) -> String {
    const UNITS: &[(f64, f64, &str)] = &[
        (1e-9, 1000.0, "n"),
        (1e-6, 1000.0, "u"),
        (1e-3, 1000.0, "m"),
        (1.0, 60.0, "s"),
        (60.0, 60.0, "M"),
        (3600.0, 24.0, "H"),
        (86400.0, 365.0, "D"),
        (86400.0 * 365.0, 1000.0, "Y"),
    ];

    if (dur * 1e9).round() == 0.0 {
        return "0".into();
    }
    for (unit, max, suffix) in UNITS.iter() {
        let scaled = dur / unit;
        if scaled < 99.95 {
            return format!("{:.1}{}", scaled.max(0.1), suffix);
        } else if scaled < *max {
            return format!("{:.0}{}", scaled, suffix);
        }
    }
    "INF".into()
}

pub fn format_pct(ratio: f64) -> String {
    let pct = ratio * TO_PCT;
    if pct < 0.0 {
        "NEG".into()
    } else if pct == 0.0 {
        "0".into()
    } else if pct < 99.995 {
        format!("{:.02}", pct)
    } else if pct < 999.95 {
        format!("{:.01}", pct)
    } else {
        format!("{:.0}", pct)
    }
}

/// Frequencies and powers are reported in SI units. Print them compactly,
/// e.g. 2.4e9 Hz as "2.4G".
pub fn format_si(value: f64) -> String {
    const UNITS: &[(f64, &str)] = &[(1e12, "T"), (1e9, "G"), (1e6, "M"), (1e3, "k")];
    for (unit, suffix) in UNITS.iter() {
        if value.abs() >= *unit {
            let scaled = value / unit;
            let mut buf = format!("{:.3}", scaled);
            while buf.ends_with('0') {
                buf.pop();
            }
            if buf.ends_with('.') {
                buf.pop();
            }
            return buf + suffix;
        }
    }
    format!("{}", value)
}

pub fn parse_duration(input: &str) -> Result<f64> {
    let mut num = String::new();
    let mut sum = 0.0;
    for ch in input.chars() {
        let mult = match ch {
            '_' => continue,
            'm' => 0.001,
            's' => 1.0,
            'M' => 60.0,
            'H' => 3600.0,
            'D' => 86400.0,
            ch => {
                num.push(ch);
                continue;
            }
        };
        sum += num
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid duration {:?}", input))?
            * mult;
        num.clear();
    }
    if !num.trim().is_empty() {
        sum += num
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid duration {:?}", input))?;
    }
    if sum < 0.0 {
        bail!("duration {:?} is negative", input);
    }
    Ok(sum)
}

fn is_executable<P: AsRef<Path>>(path: P) -> bool {
    match path.as_ref().metadata() {
        Ok(md) => md.is_file() && md.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

pub fn exe_dir() -> Result<PathBuf> {
    let mut path = env::current_exe()?;
    path.pop();
    Ok(path)
}

pub fn find_bin<N: AsRef<OsStr>, P: AsRef<OsStr>>(
    name_in: N,
    prepend_in: Option<P>,
) -> Option<PathBuf> {
    let name = name_in.as_ref();
    let mut search = OsString::new();
    if let Some(prepend) = prepend_in.as_ref() {
        search.push(prepend);
        search.push(":");
    }
    if let Some(dirs) = env::var_os("PATH") {
        search.push(dirs);
    }
    for dir in env::split_paths(&search) {
        let path = dir.join(name);
        if let Ok(path) = path.canonicalize() {
            if is_executable(&path) {
                return Some(path);
            }
        }
    }
    None
}

pub fn set_executable<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let mut perm = fs::metadata(path)?.permissions();
    perm.set_mode(0o755);
    fs::set_permissions(path, perm).with_context(|| format!("chmod 755 {:?}", path))?;
    Ok(())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn format_unix_time(time: u64) -> String {
    DateTime::<Local>::from(UNIX_EPOCH + Duration::from_secs(time))
        .format("%a %b %d %H:%M:%S %Y")
        .to_string()
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            let _ = sl::SimpleLogger::init(sl_level, lcfg.build());
        }
    }
}

/// Forward lines read from a child's stdout or stderr to `tx`. Returns
/// when the pipe closes or the receiver goes away.
pub fn child_reader_thread<R: Read>(name: String, pipe: R, tx: Sender<String>) {
    let reader = BufReader::new(pipe);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if let Err(e) = tx.send(line) {
                    info!("{}: Reader thread terminating ({:?})", &name, &e);
                    break;
                }
            }
            Err(e) => {
                warn!("{}: Failed to read from child ({:?})", &name, &e);
                break;
            }
        }
    }
}

pub fn run_command(cmd: &mut Command, emsg: &str) -> Result<()> {
    let cmd_str = format!("{:?}", &cmd);

    match cmd.status() {
        Ok(rc) if rc.success() => Ok(()),
        Ok(rc) => bail!("{} ({}): {}", &cmd_str, &rc, emsg),
        Err(e) => bail!("{} ({}): {}", &cmd_str, &e, emsg),
    }
}

/// Run `cmd` to completion and return its stdout. Non-zero exit is an
/// error carrying the command line and the stderr output.
pub fn command_output(cmd: &mut Command) -> Result<String> {
    let cmd_str = format!("{:?}", &cmd);
    let output = cmd
        .output()
        .with_context(|| format!("Failed to execute {}", &cmd_str))?;
    if !output.status.success() {
        bail!(
            "{} ({}): {}",
            &cmd_str,
            &output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// How SIGINT is handled while launched children are registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// Forward every SIGINT to the children.
    Forward,
    /// Swallow the first SIGINT with a warning and abort on a second one
    /// within a second, the way srun does.
    ConfirmWithin1s,
}

struct GlobalProgState {
    exiting: bool,
    children: Vec<u32>,
    mode: InterruptMode,
    last_interrupt: Option<Instant>,
}

lazy_static::lazy_static! {
    static ref PROG_STATE: Mutex<GlobalProgState> = Mutex::new(GlobalProgState {
        exiting: false,
        children: vec![],
        mode: InterruptMode::Forward,
        last_interrupt: None,
    });
    static ref PROG_WAITQ: Condvar = Condvar::new();
}

static SETUP_ONCE: Once = Once::new();

fn signal_children(children: &[u32]) {
    for pid in children.iter() {
        unsafe {
            libc::kill(*pid as libc::pid_t, libc::SIGINT);
        }
    }
}

fn handle_interrupt() {
    let mut state = match PROG_STATE.lock() {
        Ok(v) => v,
        Err(_) => return,
    };

    if state.children.is_empty() {
        info!("SIGINT/TERM received, exiting...");
        state.exiting = true;
        PROG_WAITQ.notify_all();
        return;
    }

    if state.mode == InterruptMode::ConfirmWithin1s {
        let confirmed = match state.last_interrupt {
            Some(at) => at.elapsed() < Duration::from_secs(1),
            None => false,
        };
        if !confirmed {
            eprintln!("srun: interrupt (one more within 1 sec to abort)");
            state.last_interrupt = Some(Instant::now());
            return;
        }
        // srun itself wants two interrupts in quick succession
        signal_children(&state.children);
    }
    signal_children(&state.children);
    state.exiting = true;
    PROG_WAITQ.notify_all();
}

pub fn setup_prog_state() {
    SETUP_ONCE.call_once(|| {
        if let Err(e) = ctrlc::set_handler(handle_interrupt) {
            warn!("Failed to install SIGINT handler ({})", &e);
        }
    });
}

pub fn register_child(pid: u32, mode: InterruptMode) {
    let mut state = PROG_STATE.lock().unwrap();
    state.children.push(pid);
    state.mode = mode;
    state.last_interrupt = None;
}

pub fn unregister_child(pid: u32) {
    PROG_STATE.lock().unwrap().children.retain(|x| *x != pid);
}

/// Sleep for `dur` unless the program is told to exit in the meantime.
/// Returns false if woken up by an exit request.
pub fn sleep_unless_exiting(dur: Duration) -> bool {
    let deadline = Instant::now() + dur;
    let mut state = PROG_STATE.lock().unwrap();
    loop {
        if state.exiting {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        state = PROG_WAITQ.wait_timeout(state, deadline - now).unwrap().0;
    }
}
