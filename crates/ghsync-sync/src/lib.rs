//! Upstream permission synchronization.
//!
//! The [`processor::Processor`] handles collaborator and link requests,
//! the [`worker::Worker`] periodically reconciles the whole forest, and
//! the [`synchronizer`] keeps the derived hierarchy flags consistent for
//! both. Upstream calls always go through the scheduler lanes.

pub mod config;
pub mod error;
pub mod estimate;
pub mod notifier;
pub mod processor;
pub mod synchronizer;
pub mod upstream;
pub mod worker;

pub use config::{SyncConfig, WorkerConfig};
pub use error::UpstreamError;
pub use estimate::estimate_duration;
pub use notifier::{
    LogNotifier, UnverifiedAction, UnverifiedNotifier, UnverifiedPayload, UnverifiedUser,
};
pub use processor::{
    Action, AddUserInput, DeleteUserInput, LinkInput, Processor, RemoveUserInput,
    UpdateUserInput, VerifyUserInput,
};
pub use synchronizer::{prune_placeholders, reconcile_permission, remove_permission};
pub use upstream::{
    Collaborator, LinkInfo, ScheduledUpstream, UpstreamClient, UpstreamRepository, UpstreamUser,
};
pub use worker::Worker;
