//! Synchronization configuration.

use std::time::Duration;

use ghsync_scheduler::LanesConfig;
use serde::Deserialize;

/// Reconciliation worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pause between two successful passes (default: 900 = 15 minutes).
    pub interval_secs: u64,
    /// Pause after a failed pass (default: 900).
    pub backoff_secs: u64,
    /// Overhead multiplier applied to request counts in refresh estimates.
    pub estimate_factor: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            backoff_secs: 900,
            estimate_factor: 1.4,
        }
    }
}

impl WorkerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub lanes: LanesConfig,
    pub worker: WorkerConfig,
}
