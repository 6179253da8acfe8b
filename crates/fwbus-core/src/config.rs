//! Bus handle configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration of a bus handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Default timeout of a transaction, in milliseconds.
    pub transaction_timeout_ms: u64,
    /// Window for an FCP response frame, in milliseconds.
    pub fcp_timeout_ms: u64,
    /// Extra window granted by an INTERIM response, in milliseconds.
    pub fcp_interim_timeout_ms: u64,
    /// Dispatcher idle wait, in milliseconds.
    pub poll_interval_ms: u64,
    /// Log every bus event through `tracing`.
    pub trace_events: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 200,
            fcp_timeout_ms: 200,
            fcp_interim_timeout_ms: 200,
            poll_interval_ms: 10,
            trace_events: true,
        }
    }
}

impl BusConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BusConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Never zero, so the dispatcher does not spin.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
