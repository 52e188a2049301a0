//! Permission domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resource::{Resource, ResourceKind};

/// The access a principal holds at one resource.
///
/// `parent_link`, `has_parent` and `has_child` are derived by the
/// permission synchronizer and must only be written through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// External id of the principal on the upstream platform.
    pub principal_id: i64,
    /// Internal identity id, `None` until the principal is verified.
    pub user_id: Option<i64>,
    pub username: String,
    pub resource_link: String,
    pub resource_kind: ResourceKind,
    pub access_level: String,
    /// Link of the nearest ancestor resource where the same principal
    /// also holds a permission.
    pub parent_link: Option<String>,
    pub has_parent: bool,
    pub has_child: bool,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Row version in the store, bumped on every committed write. `0` for
    /// rows never committed.
    #[serde(default)]
    pub version: u64,
}

impl Permission {
    /// Access level of rows synthesized at ancestor resources where the
    /// principal has no indexed access of its own. Never a real upstream
    /// role, so it can not compare equal to one.
    pub const PLACEHOLDER_ACCESS_LEVEL: &'static str = "unindexed";

    pub fn key(&self) -> PermissionKey {
        PermissionKey::new(self.principal_id, &self.resource_link)
    }

    pub fn is_placeholder(&self) -> bool {
        self.access_level == Self::PLACEHOLDER_ACCESS_LEVEL
    }

    /// Placeholder row at `resource` carrying the identity of `template`.
    pub fn placeholder(
        template: &Permission,
        resource: &Resource,
        parent_link: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            principal_id: template.principal_id,
            user_id: template.user_id,
            username: template.username.clone(),
            resource_link: resource.link.clone(),
            resource_kind: resource.kind,
            access_level: Self::PLACEHOLDER_ACCESS_LEVEL.into(),
            parent_link,
            has_parent: false,
            has_child: true,
            avatar_url: template.avatar_url.clone(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            version: 0,
        }
    }
}

/// Identity of a permission row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PermissionKey {
    pub principal_id: i64,
    pub resource_link: String,
}

impl PermissionKey {
    pub fn new(principal_id: i64, resource_link: &str) -> Self {
        Self {
            principal_id,
            resource_link: resource_link.to_string(),
        }
    }
}

/// Access observed upstream for a principal at a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertPermission {
    pub principal_id: i64,
    pub user_id: Option<i64>,
    pub username: String,
    pub resource_link: String,
    pub resource_kind: ResourceKind,
    pub access_level: String,
    pub avatar_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UpsertPermission {
    /// Merge the observation into the existing row (if any).
    ///
    /// Derived fields and `created_at` survive; `user_id` is only replaced
    /// when the observation carries one. `updated_at` is set to `now`,
    /// which is what marks the row as refreshed for expiry-by-absence.
    pub fn apply(self, existing: Option<Permission>, now: DateTime<Utc>) -> Permission {
        match existing {
            Some(current) => Permission {
                user_id: self.user_id.or(current.user_id),
                username: self.username,
                resource_kind: self.resource_kind,
                access_level: self.access_level,
                avatar_url: self.avatar_url,
                updated_at: now,
                expires_at: self.expires_at,
                ..current
            },
            None => Permission {
                principal_id: self.principal_id,
                user_id: self.user_id,
                username: self.username,
                resource_link: self.resource_link,
                resource_kind: self.resource_kind,
                access_level: self.access_level,
                parent_link: None,
                has_parent: false,
                has_child: false,
                avatar_url: self.avatar_url,
                created_at: now,
                updated_at: now,
                expires_at: self.expires_at,
                version: 0,
            },
        }
    }
}
