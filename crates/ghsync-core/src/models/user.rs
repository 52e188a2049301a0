//! User domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Correlates an upstream principal with an internal identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub principal_id: i64,
    /// Internal identity id; `None` while the user is unverified.
    pub user_id: Option<i64>,
    pub username: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl User {
    pub fn is_verified(&self) -> bool {
        self.user_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertUser {
    pub principal_id: i64,
    pub user_id: Option<i64>,
    pub username: String,
    pub avatar_url: String,
}

impl UpsertUser {
    /// Merge into the existing record. A known internal id is never
    /// cleared by an observation that lacks one.
    pub fn apply(self, existing: Option<User>, now: DateTime<Utc>) -> User {
        match existing {
            Some(current) => User {
                user_id: self.user_id.or(current.user_id),
                username: self.username,
                avatar_url: self.avatar_url,
                updated_at: now,
                ..current
            },
            None => User {
                principal_id: self.principal_id,
                user_id: self.user_id,
                username: self.username,
                avatar_url: self.avatar_url,
                created_at: now,
                updated_at: now,
                version: 0,
            },
        }
    }
}
