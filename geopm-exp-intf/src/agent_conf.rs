// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result};
use geopm_util::*;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Agent name meaning "run without an agent configuration file".
pub const MONITOR_AGENT: &str = "monitor";

/// Policy key to value mapping in insertion order. GEOPM reads the
/// values positionally for some agents so the order is kept as built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy(Vec<(String, f64)>);

impl Policy {
    pub fn new() -> Self {
        Self(vec![])
    }

    /// Set `key`, replacing the value in place if it's already there.
    pub fn set(&mut self, key: &str, val: f64) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(ent) => ent.1 = val,
            None => self.0.push((key.to_string(), val)),
        }
    }

    pub fn with(mut self, key: &str, val: f64) -> Self {
        self.set(key, val);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self) -> Result<()> {
        for (k, v) in self.0.iter() {
            if !v.is_finite() {
                config_bail!("policy value for {:?} must be finite, got {}", k, v);
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Policy {
    type Item = &'a (String, f64);
    type IntoIter = std::slice::Iter<'a, (String, f64)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl serde::ser::Serialize for Policy {
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

impl<'de> serde::de::Deserialize<'de> for Policy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct PolicyVisitor;

        impl<'de> serde::de::Visitor<'de> for PolicyVisitor {
            type Value = Policy;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of policy names to numbers")
            }

            fn visit_map<M>(self, mut access: M) -> Result<Policy, M::Error>
            where
                M: serde::de::MapAccess<'de>,
            {
                let mut policy = Policy::new();
                while let Some((k, v)) = access.next_entry::<String, f64>()? {
                    policy.set(&k, v);
                }
                Ok(policy)
            }
        }

        deserializer.deserialize_map(PolicyVisitor)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.0.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Agent name plus the policy handed to it through a file.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConf {
    path: PathBuf,
    agent: String,
    policy: Policy,
}

impl AgentConf {
    pub fn new<P: AsRef<Path>>(path: P, agent: &str, policy: Policy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            agent: agent.to_string(),
            policy,
        })
    }

    pub fn monitor() -> Self {
        Self {
            path: PathBuf::new(),
            agent: MONITOR_AGENT.into(),
            policy: Policy::new(),
        }
    }

    pub fn is_monitor(&self) -> bool {
        self.agent == MONITOR_AGENT
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Write the policy as a single JSON object. Monitor has nothing to
    /// write.
    pub fn write(&self) -> Result<()> {
        if self.is_monitor() {
            return Ok(());
        }
        let mut body = serde_json::to_string_pretty(&self.policy)?;
        body.push('\n');
        fs::write(&self.path, body).with_context(|| format!("Writing {:?}", &self.path))
    }

    /// Read back a configuration written by `write()`.
    pub fn read<P: AsRef<Path>>(path: P, agent: &str) -> Result<Self> {
        let path = path.as_ref();
        let body = fs::read_to_string(path).with_context(|| format!("Reading {:?}", path))?;
        let policy: Policy =
            serde_json::from_str(&body).with_context(|| format!("Parsing {:?}", path))?;
        Self::new(path, agent, policy)
    }
}
