//! SurrealDB implementation of [`UserRepository`].

use chrono::{DateTime, Utc};
use ghsync_core::error::SyncResult;
use ghsync_core::models::user::User;
use ghsync_core::repository::{UserQuery, UserRepository};
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;

use super::CountRow;
use crate::error::DbError;

#[derive(Debug, SurrealValue)]
pub(crate) struct UserRow {
    pub principal_id: i64,
    pub user_id: Option<i64>,
    pub username: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            principal_id: row.principal_id,
            user_id: row.user_id,
            username: row.username,
            avatar_url: row.avatar_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: u64::try_from(row.version).unwrap_or_default(),
        }
    }
}

impl From<User> for UserRow {
    fn from(user: User) -> Self {
        Self {
            principal_id: user.principal_id,
            user_id: user.user_id,
            username: user.username,
            avatar_url: user.avatar_url,
            created_at: user.created_at,
            updated_at: user.updated_at,
            version: i64::try_from(user.version).unwrap_or(i64::MAX),
        }
    }
}

const USER_FILTER: &str = "\
    ($username IS NONE OR username = $username) \
    AND ($user_id IS NONE OR user_id = $user_id) \
    AND ($verified IS NONE OR (user_id IS NOT NONE) = $verified)";

#[derive(Clone)]
pub struct SurrealUserRepository<C: Connection> {
    db: Surreal<C>,
}

impl<C: Connection> SurrealUserRepository<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self { db }
    }
}

impl<C: Connection> UserRepository for SurrealUserRepository<C> {
    async fn get_by_principal(&self, principal_id: i64) -> SyncResult<Option<User>> {
        let mut result = self
            .db
            .query("SELECT * FROM type::record('user', $id)")
            .bind(("id", principal_id))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<UserRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.into_iter().next().map(Into::into))
    }

    async fn get_by_username(&self, username: &str) -> SyncResult<Option<User>> {
        let mut result = self
            .db
            .query(
                "SELECT * FROM user WHERE username = $username \
                 ORDER BY updated_at DESC LIMIT 1",
            )
            .bind(("username", username.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<UserRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.into_iter().next().map(Into::into))
    }

    async fn select(&self, query: &UserQuery) -> SyncResult<Vec<User>> {
        let mut result = self
            .db
            .query(format!(
                "SELECT * FROM user WHERE {USER_FILTER} ORDER BY principal_id ASC"
            ))
            .bind(("username", query.username.clone()))
            .bind(("user_id", query.user_id))
            .bind(("verified", query.verified))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<UserRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count(&self, query: &UserQuery) -> SyncResult<u64> {
        let mut result = self
            .db
            .query(format!(
                "SELECT count() AS total FROM user WHERE {USER_FILTER} GROUP ALL"
            ))
            .bind(("username", query.username.clone()))
            .bind(("user_id", query.user_id))
            .bind(("verified", query.verified))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<CountRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.first().map(|r| r.total).unwrap_or(0))
    }
}
