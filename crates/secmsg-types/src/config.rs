//! Runtime configuration with documented defaults.
//!
//! Only values local to one node live here. Wire-fixed constants
//! (bucket length, retention, proof-of-work rules) are compile-time
//! constants in the protocol crate — changing them would partition
//! the node from its peers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Result, SmsgError};

/// Node-local configuration for the messaging subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmsgConfig {
    /// Host data directory. Bucket files live in `smsgStore/` below
    /// it, the key-value stores in `smsgdb/`.
    pub data_dir: PathBuf,

    /// Poll interval of the background threads in milliseconds. The
    /// shutdown flag is observed at this granularity.
    pub worker_poll_ms: u64,

    /// Upper bound on the time `shutdown()` waits for the background
    /// threads, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for SmsgConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            worker_poll_ms: 1000,
            shutdown_grace_secs: 5,
        }
    }
}

impl SmsgConfig {
    /// Creates a configuration rooted at the given data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Validates all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(SmsgError::ConfigError {
                reason: "data_dir must not be empty".into(),
            });
        }

        if self.worker_poll_ms == 0 {
            return Err(SmsgError::ConfigError {
                reason: "worker_poll_ms must be greater than 0".into(),
            });
        }

        if self.shutdown_grace_secs == 0 {
            return Err(SmsgError::ConfigError {
                reason: "shutdown_grace_secs must be greater than 0".into(),
            });
        }

        Ok(())
    }
}
