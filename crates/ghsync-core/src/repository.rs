//! Repository trait definitions for data access abstraction.
//!
//! Repositories are read-only views of committed state. Every mutation of
//! resources, permissions and users is staged in a [`Transaction`] and
//! applied atomically by [`Store::commit`].

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::models::{
    link::TrackedLink,
    permission::Permission,
    resource::{Resource, ResourceKind},
    user::User,
};
use crate::transaction::{Transaction, WriteSet};

/// Pagination parameters for list queries.
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// A paginated result set.
#[derive(Debug, Clone)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

/// Whether `link` is `root` itself or nested below it.
pub fn link_is_under(link: &str, root: &str) -> bool {
    link == root
        || link
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

// ---------------------------------------------------------------------------
// Query specifications
// ---------------------------------------------------------------------------

/// Filter over resources. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct ResourceQuery {
    pub kind: Option<ResourceKind>,
    pub parent_id: Option<i64>,
    /// Only the resource with this link and its descendants.
    pub under_link: Option<String>,
    pub roots_only: bool,
}

impl ResourceQuery {
    pub fn under(link: &str) -> Self {
        Self {
            under_link: Some(link.to_string()),
            ..Self::default()
        }
    }

    pub fn children_of(parent_id: i64) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.kind.is_none_or(|kind| resource.kind == kind)
            && self
                .parent_id
                .is_none_or(|id| resource.parent_id == Some(id))
            && self
                .under_link
                .as_deref()
                .is_none_or(|root| link_is_under(&resource.link, root))
            && (!self.roots_only || resource.is_root())
    }
}

/// Filter over permissions. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct PermissionQuery {
    pub principal_id: Option<i64>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub resource_link: Option<String>,
    pub parent_link: Option<String>,
    /// Only permissions at this link or below it.
    pub under_link: Option<String>,
    /// `Some(true)` keeps only placeholders, `Some(false)` drops them.
    pub placeholder: Option<bool>,
    /// The minimal root set of a principal: no parent pointer and no
    /// equal-level parent.
    pub roots_only: bool,
    pub updated_before: Option<DateTime<Utc>>,
    pub updated_since: Option<DateTime<Utc>>,
    /// Rows whose `expires_at` is at or before this instant.
    pub expired_at: Option<DateTime<Utc>>,
}

impl PermissionQuery {
    pub fn for_principal(principal_id: i64) -> Self {
        Self {
            principal_id: Some(principal_id),
            ..Self::default()
        }
    }

    pub fn at_link(link: &str) -> Self {
        Self {
            resource_link: Some(link.to_string()),
            ..Self::default()
        }
    }

    /// Direct children of the permission `(principal_id, link)`.
    pub fn children_of(principal_id: i64, link: &str) -> Self {
        Self {
            principal_id: Some(principal_id),
            parent_link: Some(link.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, permission: &Permission) -> bool {
        self.principal_id
            .is_none_or(|id| permission.principal_id == id)
            && self.user_id.is_none_or(|id| permission.user_id == Some(id))
            && self
                .username
                .as_deref()
                .is_none_or(|name| permission.username == name)
            && self
                .resource_link
                .as_deref()
                .is_none_or(|link| permission.resource_link == link)
            && self
                .parent_link
                .as_deref()
                .is_none_or(|link| permission.parent_link.as_deref() == Some(link))
            && self
                .under_link
                .as_deref()
                .is_none_or(|root| link_is_under(&permission.resource_link, root))
            && self
                .placeholder
                .is_none_or(|wanted| permission.is_placeholder() == wanted)
            && (!self.roots_only || (!permission.has_parent && permission.parent_link.is_none()))
            && self
                .updated_before
                .is_none_or(|at| permission.updated_at < at)
            && self
                .updated_since
                .is_none_or(|at| permission.updated_at >= at)
            && self
                .expired_at
                .is_none_or(|at| permission.expires_at.is_some_and(|exp| exp <= at))
    }
}

/// Filter over users. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    pub username: Option<String>,
    pub user_id: Option<i64>,
    pub verified: Option<bool>,
}

impl UserQuery {
    pub fn matches(&self, user: &User) -> bool {
        self.username
            .as_deref()
            .is_none_or(|name| user.username == name)
            && self.user_id.is_none_or(|id| user.user_id == Some(id))
            && self.verified.is_none_or(|v| user.is_verified() == v)
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

pub trait LinkRepository: Send + Sync {
    /// Start tracking a link. Fails with `AlreadyExists` when tracked.
    fn add(&self, link: &str) -> impl Future<Output = SyncResult<TrackedLink>> + Send;
    fn remove(&self, link: &str) -> impl Future<Output = SyncResult<()>> + Send;
    fn get(&self, link: &str) -> impl Future<Output = SyncResult<Option<TrackedLink>>> + Send;
    fn list(&self) -> impl Future<Output = SyncResult<Vec<TrackedLink>>> + Send;
}

pub trait ResourceRepository: Send + Sync {
    fn get_by_id(&self, id: i64) -> impl Future<Output = SyncResult<Option<Resource>>> + Send;
    fn get_by_link(&self, link: &str)
    -> impl Future<Output = SyncResult<Option<Resource>>> + Send;
    fn select(
        &self,
        query: &ResourceQuery,
    ) -> impl Future<Output = SyncResult<Vec<Resource>>> + Send;
    fn count(&self, query: &ResourceQuery) -> impl Future<Output = SyncResult<u64>> + Send;
}

pub trait PermissionRepository: Send + Sync {
    fn get(
        &self,
        principal_id: i64,
        resource_link: &str,
    ) -> impl Future<Output = SyncResult<Option<Permission>>> + Send;
    fn select(
        &self,
        query: &PermissionQuery,
    ) -> impl Future<Output = SyncResult<Vec<Permission>>> + Send;
    fn list(
        &self,
        query: &PermissionQuery,
        pagination: Pagination,
    ) -> impl Future<Output = SyncResult<PaginatedResult<Permission>>> + Send;
    fn count(&self, query: &PermissionQuery) -> impl Future<Output = SyncResult<u64>> + Send;
}

pub trait UserRepository: Send + Sync {
    fn get_by_principal(
        &self,
        principal_id: i64,
    ) -> impl Future<Output = SyncResult<Option<User>>> + Send;
    fn get_by_username(
        &self,
        username: &str,
    ) -> impl Future<Output = SyncResult<Option<User>>> + Send;
    fn select(&self, query: &UserQuery) -> impl Future<Output = SyncResult<Vec<User>>> + Send;
    fn count(&self, query: &UserQuery) -> impl Future<Output = SyncResult<u64>> + Send;
}

/// Storage backend: the repositories plus an atomic commit of a staged
/// write set.
pub trait Store: Send + Sync + Sized {
    type Links: LinkRepository;
    type Resources: ResourceRepository;
    type Permissions: PermissionRepository;
    type Users: UserRepository;

    fn links(&self) -> &Self::Links;
    fn resources(&self) -> &Self::Resources;
    fn permissions(&self) -> &Self::Permissions;
    fn users(&self) -> &Self::Users;

    /// Apply every staged write or none of them.
    fn commit(&self, writes: WriteSet) -> impl Future<Output = SyncResult<()>> + Send;

    fn begin(&self) -> Transaction<'_, Self> {
        Transaction::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_is_under_respects_segment_boundaries() {
        assert!(link_is_under("acme", "acme"));
        assert!(link_is_under("acme/widgets", "acme"));
        assert!(!link_is_under("acmecorp", "acme"));
        assert!(!link_is_under("acme", "acme/widgets"));
    }
}
