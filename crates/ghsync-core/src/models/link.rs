//! Tracked link domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A top-level link (organization or standalone repository) that seeds
/// the resource forest walked by the reconciliation worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedLink {
    pub link: String,
    pub created_at: DateTime<Utc>,
}
