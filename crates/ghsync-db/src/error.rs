//! Database-specific error types and conversions.

use ghsync_core::error::SyncError;

/// Database-layer error type.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    /// A stored row could not be mapped back onto the domain model.
    #[error("Corrupt {entity} row: {message}")]
    Decode { entity: String, message: String },

    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },
}

impl DbError {
    pub(crate) fn decode(entity: &str, message: impl ToString) -> Self {
        Self::Decode {
            entity: entity.into(),
            message: message.to_string(),
        }
    }
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => SyncError::NotFound { entity, id },
            other => SyncError::Database(other.to_string()),
        }
    }
}
