//! SurrealDB implementation of [`LinkRepository`].

use chrono::{DateTime, Utc};
use ghsync_core::error::{SyncError, SyncResult};
use ghsync_core::models::link::TrackedLink;
use ghsync_core::repository::LinkRepository;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;

use crate::error::DbError;

#[derive(Debug, SurrealValue)]
struct TrackedLinkRow {
    link: String,
    created_at: DateTime<Utc>,
}

impl From<TrackedLinkRow> for TrackedLink {
    fn from(row: TrackedLinkRow) -> Self {
        Self {
            link: row.link,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct SurrealLinkRepository<C: Connection> {
    db: Surreal<C>,
}

impl<C: Connection> SurrealLinkRepository<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self { db }
    }
}

impl<C: Connection> LinkRepository for SurrealLinkRepository<C> {
    async fn add(&self, link: &str) -> SyncResult<TrackedLink> {
        if self.get(link).await?.is_some() {
            return Err(SyncError::AlreadyExists {
                entity: format!("tracked_link {link}"),
            });
        }

        let result = self
            .db
            .query("CREATE type::record('tracked_link', $link) SET link = $link")
            .bind(("link", link.to_string()))
            .await
            .map_err(DbError::from)?;
        let mut result = result.check().map_err(DbError::from)?;

        let rows: Vec<TrackedLinkRow> = result.take(0).map_err(DbError::from)?;
        rows.into_iter()
            .next()
            .map(Into::into)
            .ok_or_else(|| SyncError::not_found("tracked_link", link))
    }

    async fn remove(&self, link: &str) -> SyncResult<()> {
        self.db
            .query("DELETE type::record('tracked_link', $link)")
            .bind(("link", link.to_string()))
            .await
            .map_err(DbError::from)?
            .check()
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn get(&self, link: &str) -> SyncResult<Option<TrackedLink>> {
        let mut result = self
            .db
            .query("SELECT * FROM type::record('tracked_link', $link)")
            .bind(("link", link.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<TrackedLinkRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.into_iter().next().map(Into::into))
    }

    async fn list(&self) -> SyncResult<Vec<TrackedLink>> {
        let mut result = self
            .db
            .query("SELECT * FROM tracked_link ORDER BY link ASC")
            .await
            .map_err(DbError::from)?;
        let rows: Vec<TrackedLinkRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
