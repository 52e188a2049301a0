//! Unit of work over a [`Store`].
//!
//! A [`Transaction`] stages writes in memory and answers reads through the
//! staged state first, so a multi-step operation sees its own writes before
//! they are committed. Dropping a transaction without calling
//! [`Transaction::commit`] discards everything it staged.
//!
//! Permission and user reads also record the committed version of every
//! row they return. A staged write to a row that was read is committed
//! only if the row still has that version, so two units of work racing on
//! the same row can not silently overwrite each other. The loser gets a
//! [`SyncError::Conflict`](crate::error::SyncError::Conflict).

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::SyncResult;
use crate::models::{
    permission::{Permission, PermissionKey},
    resource::Resource,
    user::User,
};
use crate::repository::{
    PermissionQuery, PermissionRepository, ResourceQuery, ResourceRepository, Store, UserQuery,
    UserRepository,
};

/// Staged writes. `None` marks a deletion.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    pub resources: BTreeMap<i64, Option<Resource>>,
    pub permissions: BTreeMap<PermissionKey, Option<Permission>>,
    pub users: BTreeMap<i64, Option<User>>,
    /// Committed version each staged permission was read at, `None` when
    /// it was read as absent. Rows never read are written unguarded.
    pub permission_versions: BTreeMap<PermissionKey, Option<u64>>,
    pub user_versions: BTreeMap<i64, Option<u64>>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.permissions.is_empty() && self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len() + self.permissions.len() + self.users.len()
    }
}

/// Versions of committed rows as first seen by a transaction.
#[derive(Debug, Default)]
struct ReadSet {
    permissions: BTreeMap<PermissionKey, Option<u64>>,
    users: BTreeMap<i64, Option<u64>>,
}

pub struct Transaction<'a, S: Store> {
    store: &'a S,
    writes: WriteSet,
    reads: Mutex<ReadSet>,
}

impl<'a, S: Store> Transaction<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            writes: WriteSet::default(),
            reads: Mutex::new(ReadSet::default()),
        }
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    pub fn writes(&self) -> &WriteSet {
        &self.writes
    }

    pub async fn commit(self) -> SyncResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let reads = self.reads.into_inner();
        let mut writes = self.writes;
        writes.permission_versions = writes
            .permissions
            .keys()
            .filter_map(|key| Some((key.clone(), *reads.permissions.get(key)?)))
            .collect();
        writes.user_versions = writes
            .users
            .keys()
            .filter_map(|id| Some((*id, *reads.users.get(id)?)))
            .collect();
        self.store.commit(writes).await
    }

    // The first read of a row wins: staged writes derive from it.
    fn read_permission(&self, key: PermissionKey, version: Option<u64>) {
        self.reads.lock().permissions.entry(key).or_insert(version);
    }

    fn read_user(&self, principal_id: i64, version: Option<u64>) {
        self.reads.lock().users.entry(principal_id).or_insert(version);
    }

    // -- resources ----------------------------------------------------------

    pub async fn resource_by_id(&self, id: i64) -> SyncResult<Option<Resource>> {
        if let Some(staged) = self.writes.resources.get(&id) {
            return Ok(staged.clone());
        }
        self.store.resources().get_by_id(id).await
    }

    pub async fn resource_by_link(&self, link: &str) -> SyncResult<Option<Resource>> {
        if let Some(staged) = self
            .writes
            .resources
            .values()
            .flatten()
            .find(|r| r.link == link)
        {
            return Ok(Some(staged.clone()));
        }
        match self.store.resources().get_by_link(link).await? {
            // Committed row shadowed by a staged rewrite or deletion.
            Some(found) if self.writes.resources.contains_key(&found.id) => Ok(None),
            other => Ok(other),
        }
    }

    pub async fn select_resources(&self, query: &ResourceQuery) -> SyncResult<Vec<Resource>> {
        let committed = self.store.resources().select(query).await?;
        let mut merged: BTreeMap<i64, Resource> = committed
            .into_iter()
            .filter(|r| !self.writes.resources.contains_key(&r.id))
            .map(|r| (r.id, r))
            .collect();
        for staged in self.writes.resources.values().flatten() {
            if query.matches(staged) {
                merged.insert(staged.id, staged.clone());
            }
        }
        Ok(merged.into_values().collect())
    }

    pub fn put_resource(&mut self, resource: Resource) {
        self.writes.resources.insert(resource.id, Some(resource));
    }

    pub fn delete_resource(&mut self, id: i64) {
        self.writes.resources.insert(id, None);
    }

    // -- permissions --------------------------------------------------------

    pub async fn permission(
        &self,
        principal_id: i64,
        resource_link: &str,
    ) -> SyncResult<Option<Permission>> {
        let key = PermissionKey::new(principal_id, resource_link);
        if let Some(staged) = self.writes.permissions.get(&key) {
            return Ok(staged.clone());
        }
        let found = self
            .store
            .permissions()
            .get(principal_id, resource_link)
            .await?;
        self.read_permission(key, found.as_ref().map(|p| p.version));
        Ok(found)
    }

    pub async fn select_permissions(
        &self,
        query: &PermissionQuery,
    ) -> SyncResult<Vec<Permission>> {
        let committed = self.store.permissions().select(query).await?;
        let mut merged: BTreeMap<PermissionKey, Permission> = committed
            .into_iter()
            .map(|p| (p.key(), p))
            .filter(|(key, _)| !self.writes.permissions.contains_key(key))
            .collect();
        for (key, permission) in &merged {
            self.read_permission(key.clone(), Some(permission.version));
        }
        for staged in self.writes.permissions.values().flatten() {
            if query.matches(staged) {
                merged.insert(staged.key(), staged.clone());
            }
        }
        Ok(merged.into_values().collect())
    }

    pub fn put_permission(&mut self, permission: Permission) {
        self.writes
            .permissions
            .insert(permission.key(), Some(permission));
    }

    pub fn delete_permission(&mut self, key: PermissionKey) {
        self.writes.permissions.insert(key, None);
    }

    // -- users --------------------------------------------------------------

    pub async fn user(&self, principal_id: i64) -> SyncResult<Option<User>> {
        if let Some(staged) = self.writes.users.get(&principal_id) {
            return Ok(staged.clone());
        }
        let found = self.store.users().get_by_principal(principal_id).await?;
        self.read_user(principal_id, found.as_ref().map(|u| u.version));
        Ok(found)
    }

    pub async fn user_by_username(&self, username: &str) -> SyncResult<Option<User>> {
        if let Some(staged) = self
            .writes
            .users
            .values()
            .flatten()
            .find(|u| u.username == username)
        {
            return Ok(Some(staged.clone()));
        }
        match self.store.users().get_by_username(username).await? {
            Some(found) if self.writes.users.contains_key(&found.principal_id) => Ok(None),
            Some(found) => {
                self.read_user(found.principal_id, Some(found.version));
                Ok(Some(found))
            }
            None => Ok(None),
        }
    }

    pub async fn select_users(&self, query: &UserQuery) -> SyncResult<Vec<User>> {
        let committed = self.store.users().select(query).await?;
        let mut merged: BTreeMap<i64, User> = committed
            .into_iter()
            .filter(|u| !self.writes.users.contains_key(&u.principal_id))
            .map(|u| (u.principal_id, u))
            .collect();
        for user in merged.values() {
            self.read_user(user.principal_id, Some(user.version));
        }
        for staged in self.writes.users.values().flatten() {
            if query.matches(staged) {
                merged.insert(staged.principal_id, staged.clone());
            }
        }
        Ok(merged.into_values().collect())
    }

    pub fn put_user(&mut self, user: User) {
        self.writes.users.insert(user.principal_id, Some(user));
    }

    pub fn delete_user(&mut self, principal_id: i64) {
        self.writes.users.insert(principal_id, None);
    }
}
