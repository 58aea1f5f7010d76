use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`Runner`](super::Runner).
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// let config: oracleflow::RunnerConfig =
///     serde_json::from_str(r#"{"max_concurrent": 4}"#).unwrap();
/// assert_eq!(config.max_concurrent, 4);
/// assert_eq!(config.poll_interval_ms, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Tasks executing at once across all runs.
    pub max_concurrent: usize,
    /// Store polling cadence for claims held elsewhere and for foreign runs.
    pub poll_interval_ms: u64,
    /// Per-request timeout of the default HTTP transport.
    pub http_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            poll_interval_ms: 50,
            http_timeout_ms: 15_000,
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
