// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use geopm_util::*;

pub mod agent_conf;
pub mod args;
pub mod init_control;
pub mod machine;
pub mod tuned_config;

pub use agent_conf::{AgentConf, Policy, MONITOR_AGENT};
pub use args::{Args, Mode};
pub use init_control::{parse_init_control, write_init_control, InitControl, MEM_BW_INIT_CONTROL};
pub use machine::{MachineRecord, BOARD_SIGNALS, DRAM_SIGNAL, MACHINE_FILENAME};
pub use tuned_config::{TunedConfig, TunedConst};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub static ref FULL_VERSION: String = full_version(*VERSION);
}
