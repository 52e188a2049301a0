//! Scheduler configuration.

use std::time::Duration;

use serde::Deserialize;

/// Limits of one scheduler lane.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Name used in log fields.
    pub lane: String,
    /// Invocation starts allowed per `time_limit_secs` window.
    pub requests_amount: u32,
    pub time_limit_secs: u64,
    /// Hard timeout of a single invocation.
    pub call_timeout_secs: u64,
    /// Upper bound of a single throttle backoff.
    pub max_backoff_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lane: "default".into(),
            requests_amount: 5000,
            time_limit_secs: 3600,
            call_timeout_secs: 30,
            max_backoff_secs: 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn named(lane: &str) -> Self {
        Self {
            lane: lane.into(),
            ..Self::default()
        }
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Average time budget of one request under the quota.
    pub fn per_request(&self) -> Duration {
        self.time_limit() / self.requests_amount.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
    pub service: SchedulerConfig,
    pub user: SchedulerConfig,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            service: SchedulerConfig::named("service"),
            user: SchedulerConfig::named("user"),
        }
    }
}
