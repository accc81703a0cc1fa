// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use console::style;
use log::warn;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use super::report::{RawReportCollection, Table, FOM_KEY, PKG_ENERGY_KEYS, RUNTIME_KEY};
use super::trace::{check_sample_period, trial_of, AppOutput, DFL_SAMPLE_PERIOD};
use geopm_util::*;

pub const TOTALS_REGION: &str = "<totals>";

#[derive(Default)]
struct Acc {
    runs: Vec<String>,
    runtime: (f64, usize),
    energy: (f64, usize),
    fom: (f64, usize),
}

fn add(acc: &mut (f64, usize), val: Option<f64>) {
    if let Some(v) = val {
        acc.0 += v;
        acc.1 += 1;
    }
}

fn mean(acc: (f64, usize)) -> Option<f64> {
    match acc.1 {
        0 => None,
        nr => Some(acc.0 / nr as f64),
    }
}

/// Profile name without the trailing trial index.
pub fn config_of(profile: &str) -> &str {
    match (trial_of(profile), profile.rfind('_')) {
        (Some(_), Some(pos)) => &profile[..pos],
        _ => profile,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub config: String,
    pub agent: String,
    pub region: String,
    pub nr_runs: usize,
    pub runtime: Option<f64>,
    pub energy: Option<f64>,
    pub fom: Option<f64>,
}

/// Means over trials and hosts per (configuration, agent, region).
pub fn summarize(regions: &Table, totals: &Table) -> Vec<Summary> {
    let mut groups = BTreeMap::<(String, String, String), Acc>::new();
    for (table, region_override) in &[(regions, None), (totals, Some(TOTALS_REGION))] {
        for row in table.rows.iter() {
            let profile = row.get("profile").unwrap_or("");
            let region = match region_override {
                Some(v) => *v,
                None => row.get("region").unwrap_or(""),
            };
            let key = (
                config_of(profile).to_string(),
                row.get("agent").unwrap_or("").to_string(),
                region.to_string(),
            );
            let acc = groups.entry(key).or_default();
            if !acc.runs.iter().any(|x| x == profile) {
                acc.runs.push(profile.to_string());
                add(&mut acc.fom, row.get_f64(FOM_KEY));
            }
            add(&mut acc.runtime, row.get_f64(RUNTIME_KEY));
            add(&mut acc.energy, row.get_f64_any(PKG_ENERGY_KEYS));
        }
    }

    groups
        .into_iter()
        .map(|((config, agent, region), acc)| Summary {
            config,
            agent,
            region,
            nr_runs: acc.runs.len(),
            runtime: mean(acc.runtime),
            energy: mean(acc.energy),
            fom: mean(acc.fom),
        })
        .collect()
}

fn opt_fmt(val: Option<f64>, fmt: fn(f64) -> String) -> String {
    match val {
        Some(v) => fmt(v),
        None => "-".into(),
    }
}

pub fn format_summary(out: &mut String, summaries: &[Summary]) {
    let mut last_config: &str = "";
    for sum in summaries.iter() {
        if sum.config != last_config {
            writeln!(
                out,
                "\n{} ({}, {} runs)",
                style(&sum.config).bold(),
                &sum.agent,
                sum.nr_runs
            )
            .unwrap();
            writeln!(
                out,
                "  {:<32} {:>10} {:>10} {:>10}",
                "region", "runtime", "energy(J)", "FoM"
            )
            .unwrap();
            last_config = sum.config.as_str();
        }
        writeln!(
            out,
            "  {:<32} {:>10} {:>10} {:>10}",
            &sum.region,
            opt_fmt(sum.runtime, format_duration),
            opt_fmt(sum.energy, format_si),
            opt_fmt(sum.fom, format_si)
        )
        .unwrap();
    }
}

/// Sample period check of every trace in the directory.
pub fn format_traces(out: &mut String, traces: &AppOutput) {
    if traces.traces().is_empty() {
        return;
    }
    writeln!(out, "\n{}", style("Trace sample periods").bold()).unwrap();
    for trace in traces.traces().iter() {
        let name = trace
            .path
            .file_name()
            .map(|x| x.to_string_lossy().to_string())
            .unwrap_or_default();
        match check_sample_period(&trace.times(), DFL_SAMPLE_PERIOD) {
            Ok(st) => writeln!(
                out,
                "  {:<48} mean={} stdev={}",
                &name,
                format_duration(st.mean),
                format_duration(st.stdev)
            )
            .unwrap(),
            Err(e) => writeln!(out, "  {:<48} {:#}", &name, &e).unwrap(),
        }
    }
}

pub fn analyze(pattern: &str, output_dir: &Path) -> Result<String> {
    let rrc = RawReportCollection::new(pattern, output_dir)?;
    if rrc.reports().is_empty() {
        warn!("analyze: No reports matching {:?} in {:?}", pattern, output_dir);
    }
    let summaries = summarize(&rrc.get_df(), &rrc.get_app_df());
    let mut out = String::new();
    format_summary(&mut out, &summaries);
    format_traces(&mut out, &AppOutput::new("*.trace-*", output_dir)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::MODERN_REPORT;
    use std::fs;

    #[test]
    fn test_config_of() {
        for (profile, expected) in &[
            ("bench_power_governor_200w_1", "bench_power_governor_200w"),
            ("bench_monitor_default", "bench_monitor_default"),
            ("plain", "plain"),
        ] {
            assert_eq!(config_of(profile), *expected);
        }
    }

    #[test]
    fn test_analyze() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("bench_power_governor_200w_1.report"), MODERN_REPORT).unwrap();
        fs::write(
            dir.path().join("bench_power_governor_200w_2.report"),
            MODERN_REPORT
                .replace("_200w_1", "_200w_2")
                .replace("Figure of Merit: 123.5", "Figure of Merit: 125.5"),
        )
        .unwrap();

        let rrc = RawReportCollection::new("*.report", dir.path()).unwrap();
        let sums = summarize(&rrc.get_df(), &rrc.get_app_df());
        for sum in sums.iter() {
            println!("{:?}", sum);
        }
        assert_eq!(sums.len(), 3);
        let dgemm = sums.iter().find(|s| s.region == "dgemm").unwrap();
        assert_eq!(dgemm.config, "bench_power_governor_200w");
        assert_eq!(dgemm.nr_runs, 2);
        assert_eq!(dgemm.runtime, Some(11.0));
        assert_eq!(dgemm.energy, Some(2100.0));
        assert_eq!(dgemm.fom, Some(124.5));
        let totals = sums.iter().find(|s| s.region == TOTALS_REGION).unwrap();
        assert_eq!(totals.runtime, Some(15.5));

        let out = analyze("*.report", dir.path()).unwrap();
        print!("{}", &out);
        assert!(out.contains("dgemm"));
        assert!(out.contains("stream"));
    }
}
