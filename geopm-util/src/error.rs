// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use thiserror::Error;

/// Failures the harness distinguishes. Everything is carried through
/// anyhow and can be recovered with `downcast_ref::<ExpError>()`.
#[derive(Debug, Error)]
pub enum ExpError {
    /// Bad flags, unsupported topology or out of range bounds. Raised
    /// before anything is launched.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("command failed ({status}): {cmd}")]
    Launch { cmd: String, status: String },
    #[error("lookup error: {0}")]
    Lookup(String),
}

impl ExpError {
    pub fn config<S: Into<String>>(msg: S) -> anyhow::Error {
        ExpError::Config(msg.into()).into()
    }

    pub fn lookup<S: Into<String>>(msg: S) -> anyhow::Error {
        ExpError::Lookup(msg.into()).into()
    }
}

#[macro_export]
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::ExpError::config(format!($($arg)*)))
    };
}
