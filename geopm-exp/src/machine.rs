// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use scan_fmt::scan_fmt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use geopm_exp_intf::{MachineRecord, BOARD_SIGNALS, DRAM_SIGNAL, MACHINE_FILENAME};
use geopm_util::*;

/// The GEOPM read interface as far as the harness needs it.
pub trait PlatformIo {
    fn read_signal(&self, signal: &str, domain: &str, domain_idx: usize) -> Result<f64>;
    fn domain_count(&self, domain: &str) -> Result<usize>;
}

/// PlatformIo backed by the `geopmread` command line tool.
pub struct GeopmRead;

impl GeopmRead {
    pub fn parse_domains(output: &str) -> BTreeMap<String, usize> {
        let mut domains = BTreeMap::new();
        for line in output.lines() {
            if let Ok((name, nr)) = scan_fmt!(line, "{} {d}", String, usize) {
                domains.insert(name, nr);
            }
        }
        domains
    }
}

impl PlatformIo for GeopmRead {
    fn read_signal(&self, signal: &str, domain: &str, domain_idx: usize) -> Result<f64> {
        let out = command_output(
            Command::new("geopmread").args(&[signal, domain, &domain_idx.to_string()]),
        )?;
        let out = out.trim();
        out.parse::<f64>()
            .with_context(|| format!("Parsing geopmread {} output {:?}", signal, out))
    }

    fn domain_count(&self, domain: &str) -> Result<usize> {
        let out = command_output(Command::new("geopmread").arg("--domain"))?;
        match Self::parse_domains(&out).get(domain) {
            Some(nr) => Ok(*nr),
            None => bail!("geopmread --domain doesn't list {:?}", domain),
        }
    }
}

pub fn machine_path<P: AsRef<Path>>(output_dir: P) -> PathBuf {
    output_dir.as_ref().join(MACHINE_FILENAME)
}

fn reports_present(output_dir: &Path) -> Result<bool> {
    let pattern = output_dir.join("*.report");
    let pattern = pattern.to_string_lossy();
    Ok(glob::glob(&pattern)
        .with_context(|| format!("Listing {:?}", &pattern))?
        .filter_map(|x| x.ok())
        .next()
        .is_some())
}

fn read_board(pio: &dyn PlatformIo, sig: &str) -> Option<f64> {
    match pio.read_signal(sig, "board", 0) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("machine: Failed to read {} ({:#})", sig, &e);
            None
        }
    }
}

/// Read every board signal, the DRAM size and the domain counts.
/// Unreadable values are left as None.
pub fn read_machine(pio: &dyn PlatformIo) -> MachineRecord {
    let mut mach = MachineRecord::default();
    for sig in BOARD_SIGNALS.iter() {
        mach.set_signal(sig, read_board(pio, sig));
    }
    mach.dram_total = read_board(pio, DRAM_SIGNAL).filter(|v| v.is_finite() && *v > 0.0);

    for (domain, slot) in vec![
        ("core", &mut mach.num_core),
        ("package", &mut mach.num_package),
        ("gpu", &mut mach.num_gpu),
    ] {
        *slot = match pio.domain_count(domain) {
            Ok(nr) => Some(nr as f64),
            Err(e) => {
                debug!("machine: No {} count ({:#})", domain, &e);
                None
            }
        };
    }

    mach
}

/// Load the machine record of `output_dir`, reading and saving it on
/// first use. A fresh read is refused once reports exist as they would
/// no longer be guaranteed to match the record.
pub fn init<P: AsRef<Path>>(output_dir: P, pio: &dyn PlatformIo) -> Result<MachineRecord> {
    let output_dir = output_dir.as_ref();
    let path = machine_path(output_dir);
    if path.exists() {
        return MachineRecord::load(&path);
    }
    if reports_present(output_dir)? {
        config_bail!(
            "machine file {:?} missing but reports present, refusing to re-read the hardware",
            &path
        );
    }

    info!("machine: Reading hardware parameters into {:?}", &path);
    let mach = read_machine(pio);
    mach.save_atomic(&path)?;
    Ok(mach)
}

/// Load the machine record without touching the hardware.
pub fn get<P: AsRef<Path>>(output_dir: P) -> Result<MachineRecord> {
    let path = machine_path(output_dir);
    if !path.exists() {
        config_bail!("machine file {:?} missing", &path);
    }
    MachineRecord::load(&path)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;

    /// Answers from a fixed signal table and counts the reads.
    pub struct FakePlatformIo {
        pub signals: BTreeMap<String, f64>,
        pub domains: BTreeMap<String, usize>,
        pub nr_reads: Cell<usize>,
    }

    impl FakePlatformIo {
        pub fn new() -> Self {
            let signals = vec![
                ("CPU_FREQUENCY_MIN_AVAIL", 1.0e9),
                ("CPU_FREQUENCY_MAX_AVAIL", 3.7e9),
                ("CPU_FREQUENCY_STICKER", 2.4e9),
                ("CPU_FREQUENCY_STEP", 1.0e8),
                ("CPU_UNCORE_FREQUENCY_MIN_CONTROL", 1.2e9),
                ("CPU_UNCORE_FREQUENCY_MAX_CONTROL", 2.4e9),
                ("CPU_POWER_MIN_AVAIL", 70.0),
                ("CPU_POWER_LIMIT_DEFAULT", 280.0),
                ("CPU_POWER_MAX_AVAIL", 350.0),
                ("DRAM_TOTAL_BYTES", 68719476736.0),
            ];
            Self {
                signals: signals.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                domains: vec![("core", 40), ("package", 2)]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                nr_reads: Cell::new(0),
            }
        }
    }

    impl PlatformIo for FakePlatformIo {
        fn read_signal(&self, signal: &str, domain: &str, domain_idx: usize) -> Result<f64> {
            assert_eq!((domain, domain_idx), ("board", 0));
            self.nr_reads.set(self.nr_reads.get() + 1);
            match self.signals.get(signal) {
                Some(v) => Ok(*v),
                None => bail!("{} not available", signal),
            }
        }

        fn domain_count(&self, domain: &str) -> Result<usize> {
            match self.domains.get(domain) {
                Some(v) => Ok(*v),
                None => bail!("no {} domain", domain),
            }
        }
    }

    #[test]
    fn test_parse_domains() {
        let out = "board                       1\npackage                     2\ncore 40\ngpu 0\nbogus\n";
        let domains = GeopmRead::parse_domains(out);
        println!("{:?}", &domains);
        assert_eq!(domains.get("package"), Some(&2));
        assert_eq!(domains.get("core"), Some(&40));
        assert_eq!(domains.get("gpu"), Some(&0));
        assert_eq!(domains.len(), 4);
    }

    #[test]
    fn test_init_reads_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let pio = FakePlatformIo::new();

        let first = init(dir.path(), &pio).unwrap();
        let nr_reads = pio.nr_reads.get();
        assert_eq!(nr_reads, BOARD_SIGNALS.len() + 1);
        assert_eq!(first.frequency_sticker().unwrap(), 2.4e9);
        assert_eq!(first.total_dram_bytes(), Some(64 << 30));
        assert_eq!(first.num_core(), Some(40));
        assert_eq!(first.gpu_freq_min, None);

        let second = init(dir.path(), &pio).unwrap();
        assert_eq!(pio.nr_reads.get(), nr_reads);
        assert_eq!(first, second);
        assert_eq!(get(dir.path()).unwrap(), first);
    }

    #[test]
    fn test_dram_from_platform_io() {
        for (dram, expected) in &[
            (Some(68719476736.0), Some(68719476736.0)),
            (Some(0.0), None),
            (Some(std::f64::NAN), None),
            (None, None),
        ] {
            let mut pio = FakePlatformIo::new();
            match dram {
                Some(v) => pio.signals.insert(DRAM_SIGNAL.to_string(), *v),
                None => pio.signals.remove(DRAM_SIGNAL),
            };
            let mach = read_machine(&pio);
            println!("{:?} -> {:?}", dram, &mach.dram_total);
            assert_eq!(mach.dram_total, *expected);
            assert_eq!(mach.frequency_sticker().unwrap(), 2.4e9);
        }
    }

    #[test]
    fn test_init_refuses_with_reports() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("app_monitor_default_0.report"), "").unwrap();
        let err = init(dir.path(), &FakePlatformIo::new()).unwrap_err();
        println!("{:#}", &err);
        assert!(err.downcast_ref::<ExpError>().is_some());
        assert!(get(dir.path()).is_err());
    }
}
