//! Transactional [`Store`] over SurrealDB.
//!
//! A committed [`WriteSet`] becomes one `BEGIN … COMMIT` query: version
//! guards first, then deletions, then upserts, each addressed by record
//! id. SurrealDB cancels the whole transaction if any statement fails, and
//! a failed guard throws [`WRITE_CONFLICT`].

use ghsync_core::error::{SyncError, SyncResult};
use ghsync_core::models::resource::Resource;
use ghsync_core::repository::Store;
use ghsync_core::transaction::WriteSet;
use surrealdb::{Connection, Surreal};
use tracing::debug;

use crate::error::DbError;
use crate::repository::{
    PermissionRow, ResourceRow, SurrealLinkRepository, SurrealPermissionRepository,
    SurrealResourceRepository, SurrealUserRepository, UserRow, permission_record_key,
};

impl From<Resource> for ResourceRow {
    fn from(r: Resource) -> Self {
        Self {
            rid: r.id,
            path: r.path,
            link: r.link,
            kind: r.kind.as_str().to_string(),
            parent_id: r.parent_id,
            lpath: r.lpath,
        }
    }
}

#[derive(Clone)]
pub struct SurrealStore<C: Connection> {
    db: Surreal<C>,
    links: SurrealLinkRepository<C>,
    resources: SurrealResourceRepository<C>,
    permissions: SurrealPermissionRepository<C>,
    users: SurrealUserRepository<C>,
}

impl<C: Connection> SurrealStore<C> {
    /// Wrap a connection whose schema is already migrated.
    pub fn new(db: Surreal<C>) -> Self {
        Self {
            links: SurrealLinkRepository::new(db.clone()),
            resources: SurrealResourceRepository::new(db.clone()),
            permissions: SurrealPermissionRepository::new(db.clone()),
            users: SurrealUserRepository::new(db.clone()),
            db,
        }
    }

    pub fn client(&self) -> &Surreal<C> {
        &self.db
    }
}

const WRITE_CONFLICT: &str = "write conflict";

/// Version a staged row is written with: one past both the version it was
/// read at and the version it carries.
fn next_version(read_at: Option<&Option<u64>>, carried: u64) -> i64 {
    let base = read_at.copied().flatten().unwrap_or(0).max(carried);
    i64::try_from(base.saturating_add(1)).unwrap_or(i64::MAX)
}

fn guard(sql: &mut String, table: &str, param: &str) {
    sql.push_str(&format!(
        "LET ${param}_seen = array::first(\
         (SELECT VALUE version FROM type::record('{table}', ${param})));\n"
    ));
    sql.push_str(&format!(
        "IF ${param}_seen != ${param}_ver {{ THROW \"{WRITE_CONFLICT} on {table}\"; }};\n"
    ));
}

/// Statement text for a write set. Parameter names encode table and
/// position (`r3`, `p0`, `u12`); `_row` suffixes carry the content and
/// `_ver` the version a guarded row was read at.
fn commit_script(writes: &WriteSet) -> String {
    let mut sql = String::from("BEGIN TRANSACTION;\n");

    for (i, key) in writes.permissions.keys().enumerate() {
        if writes.permission_versions.contains_key(key) {
            guard(&mut sql, "permission", &format!("p{i}"));
        }
    }
    for (i, principal_id) in writes.users.keys().enumerate() {
        if writes.user_versions.contains_key(principal_id) {
            guard(&mut sql, "user", &format!("u{i}"));
        }
    }

    for (i, staged) in writes.resources.values().enumerate() {
        if staged.is_none() {
            sql.push_str(&format!("DELETE type::record('resource', $r{i});\n"));
        }
    }
    for (i, staged) in writes.permissions.values().enumerate() {
        if staged.is_none() {
            sql.push_str(&format!("DELETE type::record('permission', $p{i});\n"));
        }
    }
    for (i, staged) in writes.users.values().enumerate() {
        if staged.is_none() {
            sql.push_str(&format!("DELETE type::record('user', $u{i});\n"));
        }
    }

    for (i, staged) in writes.resources.values().enumerate() {
        if staged.is_some() {
            sql.push_str(&format!(
                "UPSERT type::record('resource', $r{i}) CONTENT $r{i}_row;\n"
            ));
        }
    }
    for (i, staged) in writes.permissions.values().enumerate() {
        if staged.is_some() {
            sql.push_str(&format!(
                "UPSERT type::record('permission', $p{i}) CONTENT $p{i}_row;\n"
            ));
        }
    }
    for (i, staged) in writes.users.values().enumerate() {
        if staged.is_some() {
            sql.push_str(&format!(
                "UPSERT type::record('user', $u{i}) CONTENT $u{i}_row;\n"
            ));
        }
    }

    sql.push_str("COMMIT TRANSACTION;");
    sql
}

impl<C: Connection> Store for SurrealStore<C> {
    type Links = SurrealLinkRepository<C>;
    type Resources = SurrealResourceRepository<C>;
    type Permissions = SurrealPermissionRepository<C>;
    type Users = SurrealUserRepository<C>;

    fn links(&self) -> &Self::Links {
        &self.links
    }

    fn resources(&self) -> &Self::Resources {
        &self.resources
    }

    fn permissions(&self) -> &Self::Permissions {
        &self.permissions
    }

    fn users(&self) -> &Self::Users {
        &self.users
    }

    async fn commit(&self, writes: WriteSet) -> SyncResult<()> {
        debug!(
            resources = writes.resources.len(),
            permissions = writes.permissions.len(),
            users = writes.users.len(),
            "Committing write set"
        );

        let mut query = self.db.query(commit_script(&writes));
        let WriteSet {
            resources,
            permissions,
            users,
            permission_versions,
            user_versions,
        } = writes;

        for (i, (id, staged)) in resources.into_iter().enumerate() {
            query = query.bind((format!("r{i}"), id));
            if let Some(resource) = staged {
                query = query.bind((format!("r{i}_row"), ResourceRow::from(resource)));
            }
        }
        for (i, (key, staged)) in permissions.into_iter().enumerate() {
            let read_at = permission_versions.get(&key);
            if let Some(version) = read_at {
                let version = version.and_then(|v| i64::try_from(v).ok());
                query = query.bind((format!("p{i}_ver"), version));
            }
            query = query.bind((
                format!("p{i}"),
                permission_record_key(key.principal_id, &key.resource_link),
            ));
            if let Some(permission) = staged {
                let mut row = PermissionRow::from(permission);
                row.version = next_version(read_at, u64::try_from(row.version).unwrap_or(0));
                query = query.bind((format!("p{i}_row"), row));
            }
        }
        for (i, (principal_id, staged)) in users.into_iter().enumerate() {
            let read_at = user_versions.get(&principal_id);
            if let Some(version) = read_at {
                let version = version.and_then(|v| i64::try_from(v).ok());
                query = query.bind((format!("u{i}_ver"), version));
            }
            query = query.bind((format!("u{i}"), principal_id));
            if let Some(user) = staged {
                let mut row = UserRow::from(user);
                row.version = next_version(read_at, u64::try_from(row.version).unwrap_or(0));
                query = query.bind((format!("u{i}_row"), row));
            }
        }

        let mut response = query.await.map_err(DbError::from)?;
        let errors = response.take_errors();
        if errors
            .values()
            .any(|err| err.to_string().contains(WRITE_CONFLICT))
        {
            debug!("Write set rejected by a version guard");
            return Err(SyncError::Conflict(
                "a staged row changed after it was read".into(),
            ));
        }
        if let Some((_, err)) = errors.into_iter().min_by_key(|(index, _)| *index) {
            return Err(DbError::from(err).into());
        }
        Ok(())
    }
}
