// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::report::{Row, Table};

pub const TIME_KEY: &str = "TIME";
pub const DFL_SAMPLE_PERIOD: f64 = 0.005;

/// One trace file. The leading `# key: value` lines are kept as meta
/// data, the rest is read as `|` delimited columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub path: PathBuf,
    pub host: String,
    pub meta: BTreeMap<String, String>,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

fn trace_host(path: &Path) -> String {
    let name = path.file_name().map(|x| x.to_string_lossy().to_string()).unwrap_or_default();
    match name.rfind(".trace-") {
        Some(pos) => name[pos + ".trace-".len()..].to_string(),
        None => String::new(),
    }
}

/// Trailing `_<n>` of a run identifier.
pub fn trial_of(name: &str) -> Option<usize> {
    let pos = name.rfind('_')?;
    name[pos + 1..].parse::<usize>().ok()
}

impl Trace {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = fs::read_to_string(path).with_context(|| format!("Reading {:?}", path))?;

        let mut meta = BTreeMap::new();
        for line in input.lines().take_while(|l| l.starts_with('#')) {
            if let Some(pos) = line.find(": ") {
                meta.insert(
                    line[1..pos].trim().to_string(),
                    line[pos + 2..].trim().to_string(),
                );
            }
        }

        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'|')
            .comment(Some(b'#'))
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(input.as_bytes());
        let columns: Vec<String> = rdr
            .headers()
            .with_context(|| format!("Reading the header of {:?}", path))?
            .iter()
            .map(|x| x.to_string())
            .collect();
        if !columns.iter().any(|c| c == TIME_KEY) {
            bail!("{:?} has no {} column", path, TIME_KEY);
        }

        let mut rows = vec![];
        for (idx, rec) in rdr.records().enumerate() {
            let rec = rec.with_context(|| format!("Reading sample {} of {:?}", idx, path))?;
            let mut row = Row::new();
            for (col, val) in columns.iter().zip(rec.iter()) {
                row.insert(col, val);
            }
            rows.push(row);
        }

        let mut host = trace_host(path);
        if host.is_empty() {
            host = meta.get("node_name").cloned().unwrap_or_default();
        }
        Ok(Self {
            path: path.to_path_buf(),
            host,
            meta,
            columns,
            rows,
        })
    }

    pub fn profile_name(&self) -> Option<&str> {
        self.meta.get("profile_name").map(|x| x.as_str())
    }

    /// From the profile name, falling back to the file name.
    pub fn trial(&self) -> Option<usize> {
        self.profile_name().and_then(trial_of).or_else(|| {
            let stem = self.path.file_name()?.to_string_lossy().to_string();
            let stem = match stem.find(".trace") {
                Some(pos) => stem[..pos].to_string(),
                None => stem,
            };
            trial_of(&stem)
        })
    }

    pub fn times(&self) -> Vec<f64> {
        self.rows.iter().filter_map(|r| r.get_f64(TIME_KEY)).collect()
    }
}

/// Every trace matching a glob under a directory.
pub struct AppOutput {
    traces: Vec<Trace>,
}

impl AppOutput {
    pub fn new(pattern: &str, dir: &Path) -> Result<Self> {
        let full = dir.join(pattern);
        let mut paths: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
            .with_context(|| format!("Invalid trace pattern {:?}", &full))?
            .filter_map(|x| x.ok())
            .collect();
        paths.sort();

        let mut traces = vec![];
        for path in paths.iter() {
            match Trace::load(path) {
                Ok(v) => traces.push(v),
                Err(e) => warn!("trace: Skipping {:?} ({:#})", path, &e),
            }
        }
        debug!("trace: Loaded {} traces from {:?}", traces.len(), &full);
        Ok(Self { traces })
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    /// All samples with `host`, `sample` index, `profile` and `trial`
    /// columns added.
    pub fn get_trace_df(&self) -> Table {
        let mut rows = vec![];
        for trace in self.traces.iter() {
            let trial = trace.trial().map(|x| x.to_string());
            for (idx, row) in trace.rows.iter().enumerate() {
                let mut row = row.clone();
                row.insert("host", &trace.host);
                row.insert("sample", &idx.to_string());
                if let Some(profile) = trace.profile_name() {
                    row.insert("profile", profile);
                }
                if let Some(trial) = trial.as_ref() {
                    row.insert("trial", trial);
                }
                rows.push(row);
            }
        }
        Table { rows }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplePeriodStats {
    pub mean: f64,
    pub stdev: f64,
    pub nr_outliers: usize,
}

/// Check trace timestamps against the sampling target: the deltas' mean
/// and standard deviation within 10% of `target`, under 1% of the deltas
/// past three standard deviations, and strictly ascending except that the
/// first two samples may share a timestamp.
pub fn check_sample_period(times: &[f64], target: f64) -> Result<SamplePeriodStats> {
    if times.len() < 3 {
        bail!("Need at least 3 samples, got {}", times.len());
    }
    let mut deltas = vec![];
    for (idx, pair) in times.windows(2).enumerate() {
        let delta = pair[1] - pair[0];
        if delta < 0.0 || (delta == 0.0 && idx > 0) {
            bail!("Sample {} at {} doesn't advance from {}", idx + 1, pair[1], pair[0]);
        }
        if delta > 0.0 {
            deltas.push(delta);
        }
    }
    if deltas.len() < 2 {
        bail!("Not enough distinct samples");
    }

    let mean = statistical::mean(&deltas);
    let stdev = statistical::standard_deviation(&deltas, Some(mean));
    let nr_outliers = deltas.iter().filter(|d| **d > mean + 3.0 * stdev).count();

    if (mean - target).abs() > 0.1 * target {
        bail!("Mean sample period {:.6}s is off by more than 10% from {}s", mean, target);
    }
    if stdev > 0.1 * target {
        bail!("Sample period stdev {:.6}s exceeds 10% of {}s", stdev, target);
    }
    if nr_outliers as f64 >= 0.01 * deltas.len() as f64 && nr_outliers > 0 {
        bail!(
            "{} of {} sample periods are beyond 3 standard deviations",
            nr_outliers,
            deltas.len()
        );
    }
    Ok(SamplePeriodStats {
        mean,
        stdev,
        nr_outliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "# geopm_version: 2.0.2
# start_time: Mon Mar 01 10:00:00 2021
# profile_name: bench_monitor_default_1
# node_name: node1
# agent: monitor
TIME|EPOCH_COUNT|REGION_HASH|CPU_ENERGY|CPU_POWER
0.000|0|0x00000000a74bbf35|100.0|150.0
0.000|0|0x00000000a74bbf35|100.5|151.0
0.005|1|0x00000000a74bbf35|101.0|152.0
0.010|1|0x00000000725e8066|101.5|153.0
";

    #[test]
    fn test_load_trace() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("bench_monitor_default_1.trace-node7"), TRACE).unwrap();
        fs::write(dir.path().join("bench_monitor_default_2.trace-node8"), "# nothing\n").unwrap();

        let out = AppOutput::new("*.trace-*", dir.path()).unwrap();
        assert_eq!(out.traces().len(), 1);
        let trace = &out.traces()[0];
        assert_eq!(trace.host, "node7");
        assert_eq!(trace.trial(), Some(1));
        assert_eq!(trace.times(), vec![0.0, 0.0, 0.005, 0.01]);

        let df = out.get_trace_df();
        assert_eq!(df.len(), 4);
        let row = &df.rows[3];
        println!("{:?}", row);
        assert_eq!(row.get("sample"), Some("3"));
        assert_eq!(row.get("trial"), Some("1"));
        assert_eq!(row.get_u64("REGION_HASH"), Some(0x725e8066));
        assert_eq!(df.column_f64("DRAM_ENERGY"), vec![None; 4]);
    }

    #[test]
    fn test_trial_of() {
        for (name, expected) in &[
            ("bench_monitor_default_3", Some(3)),
            ("hpcg_frequency_map_2.4c_12", Some(12)),
            ("nodigits", None),
            ("trailing_", None),
        ] {
            assert_eq!(trial_of(name), *expected, "{}", name);
        }
    }

    #[test]
    fn test_sample_period() {
        let mut times = vec![0.0, 0.0];
        for i in 1..1000 {
            let jitter = if i % 2 == 0 { 0.0001 } else { -0.0001 };
            times.push(i as f64 * 0.005 + jitter);
        }
        let stats = check_sample_period(&times, DFL_SAMPLE_PERIOD).unwrap();
        println!("{:?}", &stats);
        assert!((stats.mean - 0.005).abs() < 0.0001);

        let mut dup = times.clone();
        dup[10] = dup[9];
        assert!(check_sample_period(&dup, DFL_SAMPLE_PERIOD).is_err());

        let mut slow = times.clone();
        for t in slow.iter_mut().skip(500) {
            *t += 0.05;
        }
        for i in 600..1001 {
            slow[i] += (i - 600) as f64 * 0.004;
        }
        assert!(check_sample_period(&slow, DFL_SAMPLE_PERIOD).is_err());

        // steady but at the wrong rate
        for (period, ok) in &[(0.005, true), (0.0052, true), (0.05, false), (0.001, false)] {
            let jitter = period * 0.02;
            let steady: Vec<f64> = (0..1000)
                .map(|i| i as f64 * period + if i % 2 == 0 { jitter } else { -jitter })
                .collect();
            let res = check_sample_period(&steady, DFL_SAMPLE_PERIOD);
            println!("{} -> {:?}", period, &res);
            assert_eq!(res.is_ok(), *ok);
        }
    }
}
