//! Priority request scheduling for a rate-limited upstream API.
//!
//! Each [`Scheduler`] owns one background loop that drains a priority heap
//! at a bounded rate, re-issuing calls the upstream throttled. Callers
//! await their own result. [`LaneMultiplexer`] runs one scheduler per
//! credential class.

pub mod config;
pub mod error;
pub mod governor;
pub mod job;
pub mod lanes;
mod queue;
pub mod scheduler;

pub use config::{LanesConfig, SchedulerConfig};
pub use error::{SchedulerError, ThrottleAware};
pub use governor::{ResponseClass, ThrottleSignal, classify_response};
pub use job::{JobId, JobState, Priority};
pub use lanes::{Lane, LaneMultiplexer};
pub use scheduler::Scheduler;
