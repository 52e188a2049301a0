//! SurrealDB implementation of [`PermissionRepository`].

use chrono::{DateTime, Utc};
use ghsync_core::error::SyncResult;
use ghsync_core::models::permission::Permission;
use ghsync_core::repository::{
    PaginatedResult, Pagination, PermissionQuery, PermissionRepository,
};
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;

use super::{CountRow, descendant_prefix};
use crate::error::DbError;

/// Record key of a permission: one row per principal and resource link.
pub(crate) fn permission_record_key(principal_id: i64, resource_link: &str) -> String {
    format!("{principal_id}|{resource_link}")
}

#[derive(Debug, SurrealValue)]
pub(crate) struct PermissionRow {
    pub principal_id: i64,
    pub user_id: Option<i64>,
    pub username: String,
    pub resource_link: String,
    pub resource_kind: String,
    pub access_level: String,
    pub parent_link: Option<String>,
    pub has_parent: bool,
    pub has_child: bool,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl PermissionRow {
    pub(crate) fn try_into_permission(self) -> Result<Permission, DbError> {
        let resource_kind = self
            .resource_kind
            .parse()
            .map_err(|e| DbError::decode("permission", e))?;
        let version =
            u64::try_from(self.version).map_err(|e| DbError::decode("permission", e))?;
        Ok(Permission {
            principal_id: self.principal_id,
            user_id: self.user_id,
            username: self.username,
            resource_link: self.resource_link,
            resource_kind,
            access_level: self.access_level,
            parent_link: self.parent_link,
            has_parent: self.has_parent,
            has_child: self.has_child,
            avatar_url: self.avatar_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            version,
        })
    }
}

impl From<Permission> for PermissionRow {
    fn from(p: Permission) -> Self {
        Self {
            principal_id: p.principal_id,
            user_id: p.user_id,
            username: p.username,
            resource_link: p.resource_link,
            resource_kind: p.resource_kind.as_str().to_string(),
            access_level: p.access_level,
            parent_link: p.parent_link,
            has_parent: p.has_parent,
            has_child: p.has_child,
            avatar_url: p.avatar_url,
            created_at: p.created_at,
            updated_at: p.updated_at,
            expires_at: p.expires_at,
            version: i64::try_from(p.version).unwrap_or(i64::MAX),
        }
    }
}

/// Every filter of [`PermissionQuery`]; unset parameters are bound as NONE.
const PERMISSION_FILTER: &str = "\
    ($principal_id IS NONE OR principal_id = $principal_id) \
    AND ($user_id IS NONE OR user_id = $user_id) \
    AND ($username IS NONE OR username = $username) \
    AND ($resource_link IS NONE OR resource_link = $resource_link) \
    AND ($parent_link IS NONE OR parent_link = $parent_link) \
    AND ($under IS NONE OR resource_link = $under \
         OR string::starts_with(resource_link, $under_prefix)) \
    AND ($placeholder IS NONE \
         OR (access_level = $placeholder_level) = $placeholder) \
    AND ($roots_only = false \
         OR (has_parent = false AND parent_link IS NONE)) \
    AND ($updated_before IS NONE OR updated_at < $updated_before) \
    AND ($updated_since IS NONE OR updated_at >= $updated_since) \
    AND ($expired_at IS NONE \
         OR (expires_at IS NOT NONE AND expires_at <= $expired_at))";

/// SurrealDB implementation of the Permission repository.
#[derive(Clone)]
pub struct SurrealPermissionRepository<C: Connection> {
    db: Surreal<C>,
}

impl<C: Connection> SurrealPermissionRepository<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self { db }
    }
}

/// Bind every [`PermissionQuery`] parameter referenced by
/// [`PERMISSION_FILTER`] onto a query builder.
macro_rules! bind_filter {
    ($builder:expr, $query:expr) => {
        $builder
            .bind(("principal_id", $query.principal_id))
            .bind(("user_id", $query.user_id))
            .bind(("username", $query.username.clone()))
            .bind(("resource_link", $query.resource_link.clone()))
            .bind(("parent_link", $query.parent_link.clone()))
            .bind(("under", $query.under_link.clone()))
            .bind(("under_prefix", descendant_prefix($query.under_link.as_deref())))
            .bind(("placeholder", $query.placeholder))
            .bind(("placeholder_level", Permission::PLACEHOLDER_ACCESS_LEVEL))
            .bind(("roots_only", $query.roots_only))
            .bind(("updated_before", $query.updated_before))
            .bind(("updated_since", $query.updated_since))
            .bind(("expired_at", $query.expired_at))
    };
}

fn into_permissions(rows: Vec<PermissionRow>) -> Result<Vec<Permission>, DbError> {
    rows.into_iter()
        .map(PermissionRow::try_into_permission)
        .collect()
}

impl<C: Connection> PermissionRepository for SurrealPermissionRepository<C> {
    async fn get(&self, principal_id: i64, resource_link: &str) -> SyncResult<Option<Permission>> {
        let mut result = self
            .db
            .query("SELECT * FROM type::record('permission', $key)")
            .bind(("key", permission_record_key(principal_id, resource_link)))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<PermissionRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows
            .into_iter()
            .next()
            .map(PermissionRow::try_into_permission)
            .transpose()?)
    }

    async fn select(&self, query: &PermissionQuery) -> SyncResult<Vec<Permission>> {
        let sql = format!(
            "SELECT * FROM permission WHERE {PERMISSION_FILTER} \
             ORDER BY resource_link ASC, principal_id ASC"
        );
        let mut result = bind_filter!(self.db.query(sql), query)
            .await
            .map_err(DbError::from)?;
        let rows: Vec<PermissionRow> = result.take(0).map_err(DbError::from)?;
        Ok(into_permissions(rows)?)
    }

    async fn list(
        &self,
        query: &PermissionQuery,
        pagination: Pagination,
    ) -> SyncResult<PaginatedResult<Permission>> {
        let total = self.count(query).await?;

        let sql = format!(
            "SELECT * FROM permission WHERE {PERMISSION_FILTER} \
             ORDER BY resource_link ASC, principal_id ASC \
             LIMIT $limit START $offset"
        );
        let mut result = bind_filter!(self.db.query(sql), query)
            .bind(("limit", pagination.limit))
            .bind(("offset", pagination.offset))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<PermissionRow> = result.take(0).map_err(DbError::from)?;

        Ok(PaginatedResult {
            items: into_permissions(rows)?,
            total,
            offset: pagination.offset,
            limit: pagination.limit,
        })
    }

    async fn count(&self, query: &PermissionQuery) -> SyncResult<u64> {
        let sql = format!(
            "SELECT count() AS total FROM permission WHERE {PERMISSION_FILTER} GROUP ALL"
        );
        let mut result = bind_filter!(self.db.query(sql), query)
            .await
            .map_err(DbError::from)?;
        let rows: Vec<CountRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.first().map(|r| r.total).unwrap_or(0))
    }
}
