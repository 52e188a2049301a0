use std::time::Duration;

use thiserror::Error;

use crate::governor::ThrottleSignal;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The scheduler shut down before the job could complete, or the job
    /// was submitted after shutdown.
    #[error("scheduled request was cancelled")]
    Cancelled,
    #[error("scheduled request timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that can tell the scheduler the upstream asked it to slow down.
///
/// A job whose error carries a signal is re-issued after the backoff; the
/// caller never observes that error.
pub trait ThrottleAware {
    fn throttle_signal(&self) -> Option<ThrottleSignal>;
}

impl ThrottleAware for SchedulerError {
    fn throttle_signal(&self) -> Option<ThrottleSignal> {
        None
    }
}
