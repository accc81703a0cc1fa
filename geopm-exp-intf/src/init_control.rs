// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result};
use geopm_util::*;
use std::fmt;
use std::fs;
use std::path::Path;

/// Enables total memory bandwidth monitoring through the QM counters.
pub const MEM_BW_INIT_CONTROL: &str = "\
# Assign all cores to resource monitoring association ID 0
MSR::PQR_ASSOC:RMID board 0 0
# Assign the resource monitoring ID for QM Events to match ID 0
MSR::QM_EVTSEL:RMID board 0 0
# Select monitoring event ID 0x2 - Total Memory Bandwidth Monitoring
MSR::QM_EVTSEL:EVENT_ID board 0 2
";

#[derive(Debug, Clone, PartialEq)]
pub struct InitControl {
    pub control: String,
    pub domain: String,
    pub domain_idx: usize,
    pub value: f64,
}

impl fmt::Display for InitControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.control, self.domain, self.domain_idx, self.value)
    }
}

/// Parse an init-control document. Comments run from `#` to the end of
/// the line.
pub fn parse_init_control(input: &str) -> Result<Vec<InitControl>> {
    let mut controls = vec![];
    for (lineno, line) in input.lines().enumerate() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.is_empty() {
            continue;
        }
        if toks.len() != 4 {
            config_bail!(
                "init-control line {}: expected \"CONTROL DOMAIN INDEX VALUE\", got {:?}",
                lineno + 1,
                line.trim()
            );
        }
        let domain_idx = toks[2].parse::<usize>().with_context(|| {
            format!("init-control line {}: invalid domain index {:?}", lineno + 1, toks[2])
        })?;
        let value = toks[3]
            .parse::<f64>()
            .with_context(|| format!("init-control line {}: invalid value {:?}", lineno + 1, toks[3]))?;
        controls.push(InitControl {
            control: toks[0].into(),
            domain: toks[1].into(),
            domain_idx,
            value,
        });
    }
    Ok(controls)
}

/// Write `contents` after checking that it parses.
pub fn write_init_control<P: AsRef<Path>>(path: P, contents: &str) -> Result<()> {
    parse_init_control(contents)?;
    fs::write(path.as_ref(), contents).with_context(|| format!("Writing {:?}", path.as_ref()))
}
