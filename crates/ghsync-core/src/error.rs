//! Error types for ghsync.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Entity already exists: {entity}")]
    AlreadyExists { entity: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A row the resource tree implies must exist is missing, or the tree
    /// itself is malformed. Aborts the current transaction.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// A row staged by this unit of work was changed by another one after
    /// it was read. Nothing was written; re-running the unit is safe.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Whether the error should be reported to API callers as a bad
    /// request rather than a generic internal error.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
