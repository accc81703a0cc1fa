// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use geopm_util::*;
use serde::{Deserialize, Serialize};

pub const MACHINE_FILENAME: &str = "machine.json";

/// Signals read at board domain index 0.
pub const BOARD_SIGNALS: &[&str] = &[
    "CPU_FREQUENCY_MIN_AVAIL",
    "CPU_FREQUENCY_MAX_AVAIL",
    "CPU_FREQUENCY_STICKER",
    "CPU_FREQUENCY_STEP",
    "CPU_UNCORE_FREQUENCY_MIN_CONTROL",
    "CPU_UNCORE_FREQUENCY_MAX_CONTROL",
    "CPU_POWER_MIN_AVAIL",
    "CPU_POWER_LIMIT_DEFAULT",
    "CPU_POWER_MAX_AVAIL",
    "GPU_CORE_FREQUENCY_MIN_AVAIL",
    "GPU_CORE_FREQUENCY_MAX_AVAIL",
    "GPU_CORE_FREQUENCY_STEP",
];

/// Board signal holding the installed DRAM size in bytes.
pub const DRAM_SIGNAL: &str = "DRAM_TOTAL_BYTES";

/// Hardware parameters of the node type an output directory was
/// produced on. Unreadable values are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineRecord {
    #[serde(rename = "CPU_FREQUENCY_MIN_AVAIL")]
    pub cpu_freq_min: Option<f64>,
    #[serde(rename = "CPU_FREQUENCY_MAX_AVAIL")]
    pub cpu_freq_max: Option<f64>,
    #[serde(rename = "CPU_FREQUENCY_STICKER")]
    pub cpu_freq_sticker: Option<f64>,
    #[serde(rename = "CPU_FREQUENCY_STEP")]
    pub cpu_freq_step: Option<f64>,
    #[serde(rename = "CPU_UNCORE_FREQUENCY_MIN_CONTROL")]
    pub uncore_freq_min: Option<f64>,
    #[serde(rename = "CPU_UNCORE_FREQUENCY_MAX_CONTROL")]
    pub uncore_freq_max: Option<f64>,
    #[serde(rename = "CPU_POWER_MIN_AVAIL")]
    pub power_min: Option<f64>,
    #[serde(rename = "CPU_POWER_LIMIT_DEFAULT")]
    pub power_tdp: Option<f64>,
    #[serde(rename = "CPU_POWER_MAX_AVAIL")]
    pub power_max: Option<f64>,
    #[serde(rename = "GPU_CORE_FREQUENCY_MIN_AVAIL")]
    pub gpu_freq_min: Option<f64>,
    #[serde(rename = "GPU_CORE_FREQUENCY_MAX_AVAIL")]
    pub gpu_freq_max: Option<f64>,
    #[serde(rename = "GPU_CORE_FREQUENCY_STEP")]
    pub gpu_freq_step: Option<f64>,
    #[serde(rename = "NUM_CORE")]
    pub num_core: Option<f64>,
    #[serde(rename = "NUM_PACKAGE")]
    pub num_package: Option<f64>,
    #[serde(rename = "NUM_GPU")]
    pub num_gpu: Option<f64>,
    #[serde(rename = "DRAM_TOTAL_BYTES")]
    pub dram_total: Option<f64>,
}

impl JsonLoad for MachineRecord {}
impl JsonSave for MachineRecord {}

fn require(val: Option<f64>, what: &str) -> Result<f64> {
    match val {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(ExpError::config(format!("machine record is missing {}", what))),
    }
}

impl MachineRecord {
    fn slot_mut(&mut self, signal: &str) -> Option<&mut Option<f64>> {
        Some(match signal {
            "CPU_FREQUENCY_MIN_AVAIL" => &mut self.cpu_freq_min,
            "CPU_FREQUENCY_MAX_AVAIL" => &mut self.cpu_freq_max,
            "CPU_FREQUENCY_STICKER" => &mut self.cpu_freq_sticker,
            "CPU_FREQUENCY_STEP" => &mut self.cpu_freq_step,
            "CPU_UNCORE_FREQUENCY_MIN_CONTROL" => &mut self.uncore_freq_min,
            "CPU_UNCORE_FREQUENCY_MAX_CONTROL" => &mut self.uncore_freq_max,
            "CPU_POWER_MIN_AVAIL" => &mut self.power_min,
            "CPU_POWER_LIMIT_DEFAULT" => &mut self.power_tdp,
            "CPU_POWER_MAX_AVAIL" => &mut self.power_max,
            "GPU_CORE_FREQUENCY_MIN_AVAIL" => &mut self.gpu_freq_min,
            "GPU_CORE_FREQUENCY_MAX_AVAIL" => &mut self.gpu_freq_max,
            "GPU_CORE_FREQUENCY_STEP" => &mut self.gpu_freq_step,
            _ => return None,
        })
    }

    /// Record a board signal reading. Returns false for unknown names.
    pub fn set_signal(&mut self, signal: &str, val: Option<f64>) -> bool {
        match self.slot_mut(signal) {
            Some(slot) => {
                *slot = val.filter(|v| v.is_finite());
                true
            }
            None => false,
        }
    }

    pub fn frequency_min(&self) -> Result<f64> {
        require(self.cpu_freq_min, "the minimum CPU frequency")
    }

    pub fn frequency_max(&self) -> Result<f64> {
        require(self.cpu_freq_max, "the maximum CPU frequency")
    }

    pub fn frequency_sticker(&self) -> Result<f64> {
        require(self.cpu_freq_sticker, "the sticker CPU frequency")
    }

    pub fn frequency_step(&self) -> Result<f64> {
        require(self.cpu_freq_step, "the CPU frequency step")
    }

    pub fn uncore_frequency_min(&self) -> Result<f64> {
        require(self.uncore_freq_min, "the minimum uncore frequency")
    }

    pub fn uncore_frequency_max(&self) -> Result<f64> {
        require(self.uncore_freq_max, "the maximum uncore frequency")
    }

    pub fn power_package_min(&self) -> Result<f64> {
        require(self.power_min, "the minimum package power")
    }

    pub fn power_package_tdp(&self) -> Result<f64> {
        require(self.power_tdp, "the package TDP")
    }

    pub fn power_package_max(&self) -> Result<f64> {
        require(self.power_max, "the maximum package power")
    }

    pub fn gpu_frequency_min(&self) -> Result<f64> {
        require(self.gpu_freq_min, "the minimum GPU frequency")
    }

    pub fn gpu_frequency_max(&self) -> Result<f64> {
        require(self.gpu_freq_max, "the maximum GPU frequency")
    }

    pub fn gpu_frequency_step(&self) -> Result<f64> {
        require(self.gpu_freq_step, "the GPU frequency step")
    }

    pub fn num_core(&self) -> Option<usize> {
        self.num_core.map(|v| v as usize)
    }

    pub fn num_package(&self) -> Option<usize> {
        self.num_package.map(|v| v as usize)
    }

    pub fn num_gpu(&self) -> usize {
        self.num_gpu.map(|v| v as usize).unwrap_or(0)
    }

    pub fn total_dram_bytes(&self) -> Option<u64> {
        self.dram_total.map(|v| v as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_signal_and_accessors() {
        let mut mach = MachineRecord::default();
        for (sig, val, known) in &[
            ("CPU_FREQUENCY_MIN_AVAIL", Some(1.0e9), true),
            ("CPU_FREQUENCY_STICKER", Some(2.4e9), true),
            ("CPU_POWER_LIMIT_DEFAULT", Some(f64::NAN), true),
            ("BOGUS_SIGNAL", Some(1.0), false),
        ] {
            assert_eq!(mach.set_signal(sig, *val), *known);
        }
        assert_eq!(mach.frequency_min().unwrap(), 1.0e9);
        assert_eq!(mach.frequency_sticker().unwrap(), 2.4e9);
        assert_eq!(mach.power_tdp, None);
        let err = mach.power_package_tdp().unwrap_err();
        assert!(err.downcast_ref::<ExpError>().is_some());
        assert_eq!(mach.num_gpu(), 0);
        assert_eq!(mach.total_dram_bytes(), None);
        mach.dram_total = Some(68719476736.0);
        assert_eq!(mach.total_dram_bytes(), Some(64 << 30));
    }

    #[test]
    fn test_every_board_signal_has_a_slot() {
        let mut mach = MachineRecord::default();
        for sig in BOARD_SIGNALS.iter() {
            assert!(mach.set_signal(sig, Some(1.0)), "{}", sig);
        }
    }

    #[test]
    fn test_json_keys_and_nulls() {
        let mut mach = MachineRecord::default();
        mach.set_signal("CPU_FREQUENCY_STEP", Some(1.0e8));
        let json = mach.as_json().unwrap();
        println!("{}", &json);
        assert!(json.contains("\"CPU_FREQUENCY_STEP\": 100000000.0"));
        assert!(json.contains("\"GPU_CORE_FREQUENCY_STEP\": null"));
        let parsed: MachineRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, mach);
    }
}
