// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{bail, Result};
use geopm_util::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One constant of a tuned configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunedConst {
    pub domain: String,
    pub description: String,
    pub units: String,
    pub aggregation: String,
    pub values: Vec<f64>,
}

impl TunedConst {
    pub fn board(description: &str, units: &str, value: f64) -> Self {
        Self {
            domain: "board".into(),
            description: description.into(),
            units: units.into(),
            aggregation: "average".into(),
            values: vec![value],
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.values.first().cloned()
    }
}

/// Constants consumed by GEOPM agents at runtime, in the order they were
/// produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunedConfig(Vec<(String, TunedConst)>);

impl TunedConfig {
    pub fn new() -> Self {
        Self(vec![])
    }

    pub fn insert(&mut self, name: &str, cst: TunedConst) {
        match self.0.iter_mut().find(|(k, _)| k == name) {
            Some(ent) => ent.1 = cst,
            None => self.0.push((name.to_string(), cst)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TunedConst> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_value(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|c| c.value())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, TunedConst)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `(uncore frequency, max memory bandwidth)` pairs stored as
    /// `CPU_UNCORE_FREQUENCY_<i>` / `CPU_UNCORE_MAX_MEMORY_BANDWIDTH_<i>`.
    pub fn mem_bw_table(&self) -> Vec<(f64, f64)> {
        let mut table = vec![];
        for idx in 0.. {
            match (
                self.get_value(&format!("CPU_UNCORE_FREQUENCY_{}", idx)),
                self.get_value(&format!("CPU_UNCORE_MAX_MEMORY_BANDWIDTH_{}", idx)),
            ) {
                (Some(freq), Some(bw)) => table.push((freq, bw)),
                _ => break,
            }
        }
        table
    }

    /// Merge into the tuned configuration at `path`. Same named constants
    /// are replaced, the rest of the file is left alone.
    pub fn merge_into<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut raw = JsonRawFile::load(&path)?;
        let obj = match raw.value.as_object_mut() {
            Some(v) => v,
            None => bail!("{:?} is not a JSON object", path.as_ref()),
        };
        for (k, v) in self.0.iter() {
            obj.insert(k.clone(), serde_json::to_value(v)?);
        }
        raw.save()
    }
}

impl JsonLoad for TunedConfig {}
impl JsonSave for TunedConfig {}

impl serde::ser::Serialize for TunedConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> serde::de::Deserialize<'de> for TunedConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct TunedConfigVisitor;

        impl<'de> serde::de::Visitor<'de> for TunedConfigVisitor {
            type Value = TunedConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of constant names to constant objects")
            }

            fn visit_map<M>(self, mut access: M) -> Result<TunedConfig, M::Error>
            where
                M: serde::de::MapAccess<'de>,
            {
                let mut cfg = TunedConfig::new();
                while let Some((k, v)) = access.next_entry::<String, TunedConst>()? {
                    cfg.insert(&k, v);
                }
                Ok(cfg)
            }
        }

        deserializer.deserialize_map(TunedConfigVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TunedConfig {
        let mut cfg = TunedConfig::new();
        cfg.insert(
            "CPU_UNCORE_FREQUENCY_EFFICIENT_HIGH_INTENSITY",
            TunedConst::board("efficient uncore", "hertz", 1.6e9),
        );
        for (idx, (freq, bw)) in [(1.2e9, 5.0e10), (2.4e9, 9.0e10)].iter().enumerate() {
            cfg.insert(
                &format!("CPU_UNCORE_FREQUENCY_{}", idx),
                TunedConst::board("uncore", "hertz", *freq),
            );
            cfg.insert(
                &format!("CPU_UNCORE_MAX_MEMORY_BANDWIDTH_{}", idx),
                TunedConst::board("bandwidth", "none", *bw),
            );
        }
        cfg
    }

    #[test]
    fn test_mem_bw_table_and_order() {
        let cfg = sample();
        assert_eq!(cfg.mem_bw_table(), vec![(1.2e9, 5.0e10), (2.4e9, 9.0e10)]);
        let json = cfg.as_json().unwrap();
        let first = json.find("EFFICIENT_HIGH_INTENSITY").unwrap();
        let second = json.find("CPU_UNCORE_FREQUENCY_0").unwrap();
        assert!(first < second);
        let parsed: TunedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn test_merge_into_keeps_other_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("const.json");
        std::fs::write(
            &path,
            r#"{
  "GPU_CORE_FREQUENCY_EFFICIENT_HIGH_INTENSITY": {"domain": "board", "description": "", "units": "hertz", "aggregation": "average", "values": [1.1e9]},
  "CPU_UNCORE_FREQUENCY_EFFICIENT_HIGH_INTENSITY": {"domain": "board", "description": "", "units": "hertz", "aggregation": "average", "values": [2.0e9]}
}
"#,
        )
        .unwrap();
        sample().merge_into(&path).unwrap();
        let merged = TunedConfig::load(&path).unwrap();
        assert_eq!(merged.get_value("GPU_CORE_FREQUENCY_EFFICIENT_HIGH_INTENSITY"), Some(1.1e9));
        assert_eq!(merged.get_value("CPU_UNCORE_FREQUENCY_EFFICIENT_HIGH_INTENSITY"), Some(1.6e9));
        assert_eq!(merged.mem_bw_table().len(), 2);
    }
}
