//! Upstream error types.

use std::collections::HashMap;

use ghsync_core::error::SyncError;
use ghsync_scheduler::{
    ResponseClass, SchedulerError, ThrottleAware, ThrottleSignal, classify_response,
};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// The upstream asked us to slow down. Recovered by the scheduler and
    /// never seen by callers of a lane.
    #[error("upstream throttled the request")]
    Throttled(ThrottleSignal),

    #[error("upstream responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("unexpected upstream response: {0}")]
    Decode(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl UpstreamError {
    /// Error for a non-success response, or `None` when the response is a
    /// success or a plain "not found".
    pub fn from_response(
        status: u16,
        headers: &HashMap<String, String>,
        message: impl Into<String>,
    ) -> Option<Self> {
        match classify_response(status, headers) {
            ResponseClass::Success | ResponseClass::NotFound => None,
            ResponseClass::Throttled(signal) => Some(Self::Throttled(signal)),
            ResponseClass::Failed(status) => Some(Self::Status {
                status,
                message: message.into(),
            }),
        }
    }
}

impl ThrottleAware for UpstreamError {
    fn throttle_signal(&self) -> Option<ThrottleSignal> {
        match self {
            Self::Throttled(signal) => Some(*signal),
            _ => None,
        }
    }
}

impl From<UpstreamError> for SyncError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Scheduler(SchedulerError::Cancelled) => SyncError::Cancelled,
            UpstreamError::Scheduler(SchedulerError::Timeout(after)) => SyncError::Timeout(after),
            other => SyncError::Upstream(other.to_string()),
        }
    }
}
