// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use regex::Regex;
use scan_fmt::scan_fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

lazy_static::lazy_static! {
    static ref OLD_REGION_RE: Regex = Regex::new(r"^Region (.+) \((0x[0-9a-fA-F]+)\):$").unwrap();
}

pub const RUNTIME_KEY: &str = "runtime (s)";
pub const PKG_ENERGY_KEYS: &[&str] = &["package-energy (J)", "CPU_ENERGY (J)", "CPU_ENERGY"];
pub const FOM_KEY: &str = "Figure of Merit";
pub const TOTAL_RUNTIME_KEY: &str = "Total Runtime";

/// Older reports spell out the units.
fn normalize_key(key: &str) -> String {
    key.replace(" (sec)", " (s)")
        .replace(" (joules)", " (J)")
        .replace(" (watts)", " (W)")
}

fn parse_kv(text: &str) -> Option<(&str, &str)> {
    if let Some(pos) = text.find(": ") {
        Some((text[..pos].trim(), text[pos + 2..].trim()))
    } else if text.ends_with(':') {
        Some((text[..text.len() - 1].trim(), ""))
    } else {
        None
    }
}

fn parse_num(val: &str) -> Option<f64> {
    let val = val.trim().trim_matches('"');
    if let Some(hex) = val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    val.parse::<f64>().ok()
}

/// One record of string fields. Numbers are only parsed when asked for so
/// absent or odd columns never fail ingestion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(BTreeMap<String, String>);

impl Row {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: &str, val: &str) {
        self.0.insert(key.to_string(), val.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|x| x.as_str())
    }

    /// `0x` prefixed values are read as hex integers.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(parse_num)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        let val = self.get(key)?.trim().trim_matches('"');
        match val.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => val.parse::<u64>().ok(),
        }
    }

    /// First of `keys` present with a numeric value.
    pub fn get_f64_any(&self, keys: &[&str]) -> Option<f64> {
        keys.iter().find_map(|k| self.get_f64(k))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    fn merge_from(&mut self, other: &BTreeMap<String, String>) {
        for (k, v) in other.iter() {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub rows: Vec<Row>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_f64(&self, key: &str) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.get_f64(key)).collect()
    }

    pub fn filter<F: Fn(&Row) -> bool>(&self, pred: F) -> Table {
        Table {
            rows: self.rows.iter().filter(|r| pred(r)).cloned().collect(),
        }
    }

    pub fn unique(&self, key: &str) -> Vec<String> {
        let set: BTreeSet<&str> = self.rows.iter().filter_map(|r| r.get(key)).collect();
        set.into_iter().map(|x| x.to_string()).collect()
    }

    /// Mean of `value` grouped by the string value of `key`. Rows missing
    /// either are skipped.
    pub fn group_mean(&self, key: &str, value: &str) -> BTreeMap<String, f64> {
        let mut acc = BTreeMap::<String, (f64, usize)>::new();
        for row in self.rows.iter() {
            if let (Some(k), Some(v)) = (row.get(key), row.get_f64(value)) {
                let ent = acc.entry(k.to_string()).or_insert((0.0, 0));
                ent.0 += v;
                ent.1 += 1;
            }
        }
        acc.into_iter().map(|(k, (sum, nr))| (k, sum / nr as f64)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostData {
    regions: Vec<(String, Row)>,
    epoch: Option<Row>,
    totals: Option<Row>,
    unmarked: Option<Row>,
}

enum Block {
    Region(Row),
    Epoch(Row),
    Totals(Row),
    Unmarked(Row),
}

impl Block {
    fn for_title(title: &str) -> Option<Block> {
        Some(match title {
            "Epoch Totals:" => Block::Epoch(Row::new()),
            "Application Totals:" => Block::Totals(Row::new()),
            "Unmarked Totals:" => Block::Unmarked(Row::new()),
            _ => return None,
        })
    }

    fn row_mut(&mut self) -> &mut Row {
        match self {
            Block::Region(r) | Block::Epoch(r) | Block::Totals(r) | Block::Unmarked(r) => r,
        }
    }
}

struct ReportParser {
    report: RawReport,
    host: Option<String>,
    host_indent: Option<usize>,
    modern: bool,
    policy_block: bool,
    block: Option<Block>,
}

impl ReportParser {
    fn flush(&mut self) {
        let block = match self.block.take() {
            Some(v) => v,
            None => return,
        };
        let host = match self.host.as_ref() {
            Some(v) => v.clone(),
            None => return,
        };
        let data = self.report.hosts.entry(host).or_default();
        match block {
            Block::Region(row) => {
                let name = row.get("region").unwrap_or("").to_string();
                data.regions.push((name, row));
            }
            Block::Epoch(row) => data.epoch = Some(row),
            Block::Totals(row) => data.totals = Some(row),
            Block::Unmarked(row) => data.unmarked = Some(row),
        }
    }

    fn set_policy(&mut self, val: &str) {
        if val.is_empty() {
            self.policy_block = true;
            return;
        }
        if !val.starts_with('{') {
            return;
        }
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(val) {
            Ok(map) => {
                for (k, v) in map.into_iter() {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        v => v.to_string(),
                    };
                    self.report.policy.insert(k, v);
                }
            }
            Err(e) => warn!("report: Failed to parse policy {:?} ({})", val, &e),
        }
    }

    fn top_line(&mut self, text: &str) {
        self.flush();
        self.policy_block = false;

        if text == "Hosts:" {
            self.modern = true;
            self.host = None;
            self.host_indent = None;
            return;
        }
        if let Some(name) = text.strip_prefix("Host:") {
            self.host = Some(name.trim().to_string());
            return;
        }
        if self.host.is_some() && !self.modern {
            if let Some(caps) = OLD_REGION_RE.captures(text) {
                let mut row = Row::new();
                row.insert("region", &caps[1]);
                row.insert("hash", &caps[2]);
                self.block = Some(Block::Region(row));
                return;
            }
            if let Some(block) = Block::for_title(text) {
                self.block = Some(block);
                return;
            }
        }

        if let Some((key, val)) = parse_kv(text) {
            // anything at the top level ends the hosts section
            if self.modern {
                self.host = None;
                self.host_indent = None;
            }
            match key {
                "GEOPM Version" => self.report.version = val.to_string(),
                "Policy" => self.set_policy(val),
                _ => {}
            }
            self.report.meta.insert(key.to_string(), val.to_string());
        }
    }

    fn nested_line(&mut self, indent: usize, text: &str) {
        if self.policy_block {
            if let Some((key, val)) = parse_kv(text) {
                self.report.policy.insert(key.to_string(), val.to_string());
            }
            return;
        }

        if self.modern {
            let new_host = match self.host_indent {
                Some(hi) => indent <= hi,
                None => true,
            };
            if new_host && text.ends_with(':') {
                self.flush();
                self.host = Some(text.trim_end_matches(':').trim().to_string());
                self.host_indent = Some(indent);
                return;
            }
            if text == "Regions:" {
                self.flush();
                return;
            }
            let mut text = text;
            if text == "-" || text.starts_with("- ") {
                self.flush();
                self.block = Some(Block::Region(Row::new()));
                text = text[1..].trim();
                if text.is_empty() {
                    return;
                }
            }
            if let Some(block) = Block::for_title(text) {
                self.flush();
                self.block = Some(block);
                return;
            }
            self.add_field(text);
        } else {
            self.add_field(text);
        }
    }

    fn add_field(&mut self, text: &str) {
        let (key, val) = match parse_kv(text) {
            Some(v) => v,
            None => {
                debug!("report: Ignoring {:?}", text);
                return;
            }
        };
        if let Some(block) = self.block.as_mut() {
            let val = match key {
                "region" => val.trim_matches('"'),
                _ => val,
            };
            block.row_mut().insert(&normalize_key(key), val);
        }
    }
}

/// One GEOPM report. Both the `##### geopm <ver> #####` banner format
/// and the `GEOPM Version:` YAML-ish format are understood.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReport {
    path: PathBuf,
    version: String,
    meta: BTreeMap<String, String>,
    policy: BTreeMap<String, String>,
    hosts: BTreeMap<String, HostData>,
}

impl RawReport {
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = ReportParser {
            report: Default::default(),
            host: None,
            host_indent: None,
            modern: false,
            policy_block: false,
            block: None,
        };
        let mut banner = false;

        for line in input.lines() {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            if text.starts_with("#####") {
                if let Ok(ver) = scan_fmt!(text, "##### geopm {} #####", String) {
                    parser.report.version = ver;
                    banner = true;
                }
                continue;
            }
            let indent = line.len() - line.trim_start().len();
            if indent == 0 {
                parser.top_line(text);
            } else {
                parser.nested_line(indent, text);
            }
        }
        parser.flush();

        if !banner && !parser.report.meta.contains_key("GEOPM Version") {
            bail!("Missing the geopm version header");
        }
        Ok(parser.report)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = fs::read_to_string(path).with_context(|| format!("Reading {:?}", path))?;
        let mut report = Self::parse(&input).with_context(|| format!("Parsing {:?}", path))?;
        report.path = path.to_path_buf();
        Ok(report)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn meta_data(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|x| x.as_str()).filter(|x| !x.is_empty())
    }

    pub fn agent(&self) -> Option<&str> {
        self.meta_str("Agent")
    }

    pub fn profile_name(&self) -> Option<&str> {
        self.meta_str("Profile")
    }

    pub fn start_time(&self) -> Option<&str> {
        self.meta_str("Start Time")
    }

    pub fn policy(&self) -> &BTreeMap<String, String> {
        &self.policy
    }

    pub fn figure_of_merit(&self) -> Option<f64> {
        self.meta_str(FOM_KEY).and_then(parse_num)
    }

    pub fn total_runtime(&self) -> Option<f64> {
        self.meta_str(TOTAL_RUNTIME_KEY).and_then(parse_num)
    }

    pub fn host_names(&self) -> Vec<&str> {
        self.hosts.keys().map(|x| x.as_str()).collect()
    }

    pub fn region_names(&self, host: &str) -> Vec<&str> {
        match self.hosts.get(host) {
            Some(data) => data.regions.iter().map(|(name, _)| name.as_str()).collect(),
            None => vec![],
        }
    }

    pub fn raw_region(&self, host: &str, region: &str) -> Option<&Row> {
        self.hosts
            .get(host)?
            .regions
            .iter()
            .find(|(name, _)| name == region)
            .map(|(_, row)| row)
    }

    pub fn raw_epoch(&self, host: &str) -> Option<&Row> {
        self.hosts.get(host)?.epoch.as_ref()
    }

    pub fn raw_totals(&self, host: &str) -> Option<&Row> {
        self.hosts.get(host)?.totals.as_ref()
    }

    pub fn raw_unmarked(&self, host: &str) -> Option<&Row> {
        self.hosts.get(host)?.unmarked.as_ref()
    }

    /// Identifying columns added to every row taken from this report.
    fn tags(&self, host: &str) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("host".to_string(), host.to_string());
        for (key, col) in &[
            ("Agent", "agent"),
            ("Profile", "profile"),
            (FOM_KEY, FOM_KEY),
            (TOTAL_RUNTIME_KEY, TOTAL_RUNTIME_KEY),
        ] {
            if let Some(v) = self.meta_str(key) {
                tags.insert(col.to_string(), v.to_string());
            }
        }
        for (k, v) in self.policy.iter() {
            tags.insert(k.clone(), v.clone());
        }
        tags
    }
}

/// Every report matching a glob under a directory. Unreadable reports
/// are logged and left out.
pub struct RawReportCollection {
    reports: Vec<RawReport>,
}

impl RawReportCollection {
    pub fn new(pattern: &str, dir: &Path) -> Result<Self> {
        let full = dir.join(pattern);
        let mut paths: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
            .with_context(|| format!("Invalid report pattern {:?}", &full))?
            .filter_map(|x| x.ok())
            .collect();
        paths.sort();

        let mut reports = vec![];
        for path in paths.iter() {
            match RawReport::load(path) {
                Ok(v) => reports.push(v),
                Err(e) => warn!("report: Skipping {:?} ({:#})", path, &e),
            }
        }
        debug!("report: Loaded {}/{} reports from {:?}", reports.len(), paths.len(), &full);
        Ok(Self { reports })
    }

    pub fn reports(&self) -> &[RawReport] {
        &self.reports
    }

    fn collect<F>(&self, pick: F) -> Table
    where
        F: Fn(&RawReport, &str) -> Vec<Row>,
    {
        let mut rows = vec![];
        for report in self.reports.iter() {
            for host in report.host_names().into_iter() {
                let tags = report.tags(host);
                for mut row in pick(report, host).into_iter() {
                    row.merge_from(&tags);
                    rows.push(row);
                }
            }
        }
        Table { rows }
    }

    /// Per region rows.
    pub fn get_df(&self) -> Table {
        self.collect(|report, host| match report.hosts.get(host) {
            Some(data) => data.regions.iter().map(|(_, row)| row.clone()).collect(),
            None => vec![],
        })
    }

    pub fn get_epoch_df(&self) -> Table {
        self.collect(|report, host| report.raw_epoch(host).cloned().into_iter().collect())
    }

    pub fn get_app_df(&self) -> Table {
        self.collect(|report, host| report.raw_totals(host).cloned().into_iter().collect())
    }

    pub fn get_unmarked_df(&self) -> Table {
        self.collect(|report, host| report.raw_unmarked(host).cloned().into_iter().collect())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub const MODERN_REPORT: &str = r#"GEOPM Version: 2.0.2
Start Time: Mon Mar 01 10:00:00 2021
Profile: bench_power_governor_200w_1
Agent: power_governor
Policy: {"POWER_PACKAGE_LIMIT_TOTAL": 200}

Hosts:
  node1:
    Regions:
    -
      region: "dgemm"
      hash: 0x00000000a74bbf35
      runtime (s): 10.5
      count: 10
      package-energy (J): 2100
      MSR::QM_CTR_SCALED_RATE@package-0: 5.5e10
    -
      region: "stream"
      runtime (s): 4.25
      package-energy (J): 700
    Unmarked Totals:
      runtime (s): 0.5
    Epoch Totals:
      runtime (s): 14.5
    Application Totals:
      runtime (s): 15.25
      package-energy (J): 2900
  node2:
    Regions:
    -
      region: "dgemm"
      runtime (s): 11.5
    Application Totals:
      runtime (s): 15.75
Figure of Merit: 123.5
Total Runtime: 16.0
"#;

    const OLD_REPORT: &str = "##### geopm 1.1.0 #####
Start Time: Mon Mar 01 10:00:00 2021
Profile: bench_monitor_default_0
Agent: monitor
Policy: None

Host: node1
Region dgemm (0x00000000a74bbf35):
    runtime (sec): 10.5
    package-energy (joules): 2100
Epoch Totals:
    runtime (sec): 14.5
Application Totals:
    runtime (sec): 15.25
Figure of Merit:
Total Runtime: 16.0
";

    #[test]
    fn test_modern_report() {
        let report = RawReport::parse(MODERN_REPORT).unwrap();
        println!("{:#?}", &report);
        assert_eq!(report.version(), "2.0.2");
        assert_eq!(report.agent(), Some("power_governor"));
        assert_eq!(report.profile_name(), Some("bench_power_governor_200w_1"));
        assert_eq!(
            report.meta_data().get("Start Time").map(|x| x.as_str()),
            Some("Mon Mar 01 10:00:00 2021")
        );
        assert_eq!(report.policy().get("POWER_PACKAGE_LIMIT_TOTAL").map(|x| x.as_str()), Some("200"));
        assert_eq!(report.figure_of_merit(), Some(123.5));
        assert_eq!(report.total_runtime(), Some(16.0));
        assert_eq!(report.host_names(), vec!["node1", "node2"]);
        assert_eq!(report.region_names("node1"), vec!["dgemm", "stream"]);

        let dgemm = report.raw_region("node1", "dgemm").unwrap();
        assert_eq!(dgemm.get_f64(RUNTIME_KEY), Some(10.5));
        assert_eq!(dgemm.get_u64("hash"), Some(0xa74bbf35));
        assert_eq!(dgemm.get_f64("MSR::QM_CTR_SCALED_RATE@package-0"), Some(5.5e10));
        assert_eq!(dgemm.get_f64("sync-runtime (s)"), None);
        assert_eq!(report.raw_unmarked("node1").unwrap().get_f64(RUNTIME_KEY), Some(0.5));
        assert_eq!(report.raw_epoch("node1").unwrap().get_f64(RUNTIME_KEY), Some(14.5));
        assert_eq!(report.raw_totals("node2").unwrap().get_f64(RUNTIME_KEY), Some(15.75));
        assert!(report.raw_epoch("node2").is_none());
    }

    #[test]
    fn test_old_report() {
        let report = RawReport::parse(OLD_REPORT).unwrap();
        assert_eq!(report.version(), "1.1.0");
        assert!(report.policy().is_empty());
        assert_eq!(report.figure_of_merit(), None);
        assert_eq!(report.total_runtime(), Some(16.0));
        assert_eq!(report.host_names(), vec!["node1"]);
        let dgemm = report.raw_region("node1", "dgemm").unwrap();
        assert_eq!(dgemm.get_f64(RUNTIME_KEY), Some(10.5));
        assert_eq!(dgemm.get_f64_any(PKG_ENERGY_KEYS), Some(2100.0));
        assert_eq!(dgemm.get_f64("hash"), Some(0xa74bbf35u64 as f64));
        assert_eq!(report.raw_totals("node1").unwrap().get_f64(RUNTIME_KEY), Some(15.25));
    }

    #[test]
    fn test_collection() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("a.report"), MODERN_REPORT).unwrap();
        fs::write(dir.path().join("b.report"), OLD_REPORT).unwrap();
        fs::write(dir.path().join("c.report"), "garbage\n").unwrap();
        let before = fs::read_to_string(dir.path().join("a.report")).unwrap();

        let rrc = RawReportCollection::new("*.report", dir.path()).unwrap();
        assert_eq!(rrc.reports().len(), 2);

        let df = rrc.get_df();
        assert_eq!(df.len(), 4);
        assert_eq!(df.unique("host"), vec!["node1", "node2"]);
        let dgemm = df.filter(|r| r.get("region") == Some("dgemm"));
        assert_eq!(dgemm.len(), 3);
        let means = dgemm.group_mean("agent", RUNTIME_KEY);
        println!("{:?}", &means);
        assert_eq!(means.get("power_governor"), Some(&11.0));
        assert_eq!(means.get("monitor"), Some(&10.5));
        assert_eq!(
            dgemm.column_f64("POWER_PACKAGE_LIMIT_TOTAL"),
            vec![Some(200.0), Some(200.0), None]
        );

        assert_eq!(rrc.get_app_df().len(), 3);
        assert_eq!(rrc.get_epoch_df().len(), 2);
        assert_eq!(rrc.get_unmarked_df().len(), 1);
        assert_eq!(fs::read_to_string(dir.path().join("a.report")).unwrap(), before);
    }
}
