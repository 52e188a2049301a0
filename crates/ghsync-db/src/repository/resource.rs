//! SurrealDB implementation of [`ResourceRepository`].

use ghsync_core::error::SyncResult;
use ghsync_core::models::resource::Resource;
use ghsync_core::repository::{ResourceQuery, ResourceRepository};
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;

use super::{CountRow, descendant_prefix};
use crate::error::DbError;

#[derive(Debug, SurrealValue)]
pub(crate) struct ResourceRow {
    pub rid: i64,
    pub path: String,
    pub link: String,
    pub kind: String,
    pub parent_id: Option<i64>,
    pub lpath: Option<String>,
}

impl ResourceRow {
    pub(crate) fn try_into_resource(self) -> Result<Resource, DbError> {
        let kind = self
            .kind
            .parse()
            .map_err(|e| DbError::decode("resource", e))?;
        Ok(Resource {
            id: self.rid,
            path: self.path,
            link: self.link,
            kind,
            parent_id: self.parent_id,
            lpath: self.lpath,
        })
    }
}

/// Every filter of [`ResourceQuery`]; unset parameters are bound as NONE.
const RESOURCE_FILTER: &str = "\
    ($kind IS NONE OR kind = $kind) \
    AND ($parent_id IS NONE OR parent_id = $parent_id) \
    AND ($under IS NONE OR link = $under \
         OR string::starts_with(link, $under_prefix)) \
    AND ($roots_only = false OR parent_id IS NONE)";

/// SurrealDB implementation of the Resource repository.
#[derive(Clone)]
pub struct SurrealResourceRepository<C: Connection> {
    db: Surreal<C>,
}

impl<C: Connection> SurrealResourceRepository<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self { db }
    }
}

impl<C: Connection> ResourceRepository for SurrealResourceRepository<C> {
    async fn get_by_id(&self, id: i64) -> SyncResult<Option<Resource>> {
        let mut result = self
            .db
            .query("SELECT * FROM type::record('resource', $id)")
            .bind(("id", id))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<ResourceRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows
            .into_iter()
            .next()
            .map(ResourceRow::try_into_resource)
            .transpose()?)
    }

    async fn get_by_link(&self, link: &str) -> SyncResult<Option<Resource>> {
        let mut result = self
            .db
            .query("SELECT * FROM resource WHERE link = $link LIMIT 1")
            .bind(("link", link.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<ResourceRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows
            .into_iter()
            .next()
            .map(ResourceRow::try_into_resource)
            .transpose()?)
    }

    async fn select(&self, query: &ResourceQuery) -> SyncResult<Vec<Resource>> {
        let mut result = self
            .db
            .query(format!(
                "SELECT * FROM resource WHERE {RESOURCE_FILTER} ORDER BY link ASC"
            ))
            .bind(("kind", query.kind.map(|k| k.as_str().to_string())))
            .bind(("parent_id", query.parent_id))
            .bind(("under", query.under_link.clone()))
            .bind(("under_prefix", descendant_prefix(query.under_link.as_deref())))
            .bind(("roots_only", query.roots_only))
            .await
            .map_err(DbError::from)?;

        let rows: Vec<ResourceRow> = result.take(0).map_err(DbError::from)?;
        rows.into_iter()
            .map(ResourceRow::try_into_resource)
            .collect::<Result<Vec<_>, DbError>>()
            .map_err(Into::into)
    }

    async fn count(&self, query: &ResourceQuery) -> SyncResult<u64> {
        let mut result = self
            .db
            .query(format!(
                "SELECT count() AS total FROM resource WHERE {RESOURCE_FILTER} GROUP ALL"
            ))
            .bind(("kind", query.kind.map(|k| k.as_str().to_string())))
            .bind(("parent_id", query.parent_id))
            .bind(("under", query.under_link.clone()))
            .bind(("under_prefix", descendant_prefix(query.under_link.as_deref())))
            .bind(("roots_only", query.roots_only))
            .await
            .map_err(DbError::from)?;

        let rows: Vec<CountRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.first().map(|r| r.total).unwrap_or(0))
    }
}
