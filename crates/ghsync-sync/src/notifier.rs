//! Notifications to the identity-verification service about principals
//! that hold access but have no internal identity yet.

use chrono::{DateTime, Utc};
use ghsync_core::error::{SyncError, SyncResult};
use ghsync_core::models::user::User;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Module name reported to the identity service.
pub const MODULE_NAME: &str = "github";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnverifiedAction {
    /// Principals the identity service should invite.
    SetUsers,
    /// Principals that no longer need an invitation.
    DeleteUsers,
}

impl UnverifiedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetUsers => "set_users",
            Self::DeleteUsers => "delete_users",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnverifiedUser {
    pub created_at: DateTime<Utc>,
    pub module: String,
    /// Link of the root permission the principal was observed at. Empty in
    /// deletions.
    pub submodule: String,
    /// Upstream principal id.
    pub module_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub username: Option<String>,
}

impl UnverifiedUser {
    pub fn new(user: &User, submodule: &str) -> Self {
        Self {
            created_at: user.created_at,
            module: MODULE_NAME.into(),
            submodule: submodule.into(),
            module_id: user.principal_id.to_string(),
            email: None,
            name: None,
            phone: None,
            username: Some(user.username.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnverifiedPayload {
    pub action: UnverifiedAction,
    pub users: Vec<UnverifiedUser>,
}

impl UnverifiedPayload {
    pub fn set_users(users: Vec<UnverifiedUser>) -> Self {
        Self {
            action: UnverifiedAction::SetUsers,
            users,
        }
    }

    pub fn delete_users(users: Vec<UnverifiedUser>) -> Self {
        Self {
            action: UnverifiedAction::DeleteUsers,
            users,
        }
    }
}

/// Delivery of [`UnverifiedPayload`]s to the identity service.
pub trait UnverifiedNotifier: Send + Sync + 'static {
    fn publish(
        &self,
        request_id: &str,
        payload: UnverifiedPayload,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Notifier that only logs the payload. Used when no identity service is
/// configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl UnverifiedNotifier for LogNotifier {
    async fn publish(&self, request_id: &str, payload: UnverifiedPayload) -> SyncResult<()> {
        let body = serde_json::to_string(&payload)
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        info!(
            request_id,
            action = payload.action.as_str(),
            users = payload.users.len(),
            %body,
            "Unverified users notification"
        );
        Ok(())
    }
}
