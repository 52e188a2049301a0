//! Action processor: collaborator and link management requests.
//!
//! Every handler validates its input before anything is submitted to the
//! lanes, performs its upstream calls, and then applies its store writes in
//! one transaction. Notifications to the identity service are sent after
//! the commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ghsync_core::error::{SyncError, SyncResult};
use ghsync_core::models::permission::{Permission, UpsertPermission};
use ghsync_core::models::resource::{Resource, ResourceKind, normalize_link};
use ghsync_core::models::user::{UpsertUser, User};
use ghsync_core::repository::{
    LinkRepository, PermissionQuery, PermissionRepository, ResourceQuery, ResourceRepository,
    Store, UserRepository, link_is_under,
};
use ghsync_core::transaction::Transaction;
use ghsync_scheduler::Priority;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::notifier::{UnverifiedNotifier, UnverifiedPayload, UnverifiedUser};
use crate::synchronizer::{reconcile_permission, remove_permission};
use crate::upstream::{ScheduledUpstream, UpstreamClient};

/// Input for granting a principal access at a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddUserInput {
    pub request_id: String,
    pub link: String,
    pub username: String,
    /// Internal identity id of the principal.
    pub user_id: i64,
    pub access_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUserInput {
    pub request_id: String,
    pub link: String,
    pub username: String,
    pub access_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveUserInput {
    pub request_id: String,
    pub link: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteUserInput {
    pub request_id: String,
    pub username: String,
}

/// Input for binding a principal to its internal identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyUserInput {
    pub request_id: String,
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInput {
    pub request_id: String,
    pub link: String,
}

/// A request as delivered by the message bus, tagged by `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    AddUser(AddUserInput),
    UpdateUser(UpdateUserInput),
    RemoveUser(RemoveUserInput),
    DeleteUser(DeleteUserInput),
    VerifyUser(VerifyUserInput),
    RefreshLink(LinkInput),
    AddLink(LinkInput),
    RemoveLink(LinkInput),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddUser(_) => "add_user",
            Self::UpdateUser(_) => "update_user",
            Self::RemoveUser(_) => "remove_user",
            Self::DeleteUser(_) => "delete_user",
            Self::VerifyUser(_) => "verify_user",
            Self::RefreshLink(_) => "refresh_link",
            Self::AddLink(_) => "add_link",
            Self::RemoveLink(_) => "remove_link",
        }
    }
}

fn require(field: &str, value: &str) -> SyncResult<()> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(format!("`{field}` is required")));
    }
    Ok(())
}

fn require_link(link: &str) -> SyncResult<String> {
    require("link", link)?;
    let link = normalize_link(link);
    if link.is_empty() || link.split('/').any(str::is_empty) {
        return Err(SyncError::validation(format!("`{link}` is not a valid link")));
    }
    Ok(link)
}

fn require_access_level(level: &str) -> SyncResult<()> {
    require("access_level", level)?;
    if level == Permission::PLACEHOLDER_ACCESS_LEVEL {
        return Err(SyncError::validation(format!(
            "`{level}` is not a grantable access level"
        )));
    }
    Ok(())
}

fn require_user_id(user_id: i64) -> SyncResult<()> {
    if user_id <= 0 {
        return Err(SyncError::validation("`user_id` must be positive"));
    }
    Ok(())
}

/// Attempts of one unit of work before a write conflict is returned.
const COMMIT_ATTEMPTS: usize = 5;

/// Run `unit` until it commits without a write conflict. Each attempt
/// must begin its own transaction so it re-reads the rows it derives from.
pub(crate) async fn retry_conflicts<T, F, Fut>(
    unit_name: &'static str,
    mut unit: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 1;
    loop {
        match unit().await {
            Err(err) if err.is_retryable() && attempt < COMMIT_ATTEMPTS => {
                warn!(unit = unit_name, attempt, error = %err, "Write conflict, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Set `user_id` on every permission of the principal.
async fn backfill_user_id<S: Store>(
    tx: &mut Transaction<'_, S>,
    principal_id: i64,
    user_id: i64,
) -> SyncResult<usize> {
    let permissions = tx
        .select_permissions(&PermissionQuery::for_principal(principal_id))
        .await?;
    let mut updated = 0;
    for mut permission in permissions {
        if permission.user_id != Some(user_id) {
            permission.user_id = Some(user_id);
            tx.put_permission(permission);
            updated += 1;
        }
    }
    Ok(updated)
}

/// Delete the users among `principals` that hold no permission any more.
/// Returns the deleted users.
pub(crate) async fn drop_orphan_users<S: Store>(
    tx: &mut Transaction<'_, S>,
    principals: impl IntoIterator<Item = i64>,
) -> SyncResult<Vec<User>> {
    let mut dropped = Vec::new();
    for principal_id in principals {
        let remaining = tx
            .select_permissions(&PermissionQuery::for_principal(principal_id))
            .await?;
        if !remaining.is_empty() {
            continue;
        }
        if let Some(user) = tx.user(principal_id).await? {
            debug!(principal_id, "User without permissions removed");
            tx.delete_user(principal_id);
            dropped.push(user);
        }
    }
    Ok(dropped)
}

/// Handles [`Action`]s against the store and the upstream platform.
pub struct Processor<S, C, N> {
    store: Arc<S>,
    upstream: ScheduledUpstream<C>,
    notifier: Arc<N>,
}

impl<S, C, N> Clone for Processor<S, C, N> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            upstream: self.upstream.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<S, C, N> Processor<S, C, N>
where
    S: Store + 'static,
    C: UpstreamClient,
    N: UnverifiedNotifier,
{
    pub fn new(store: Arc<S>, upstream: ScheduledUpstream<C>, notifier: Arc<N>) -> Self {
        Self {
            store,
            upstream,
            notifier,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn upstream(&self) -> &ScheduledUpstream<C> {
        &self.upstream
    }

    /// Dispatch one request.
    pub async fn handle(&self, action: Action) -> SyncResult<()> {
        let name = action.name();
        let result = match action {
            Action::AddUser(input) => self.add_user(input).await.map(drop),
            Action::UpdateUser(input) => self.update_user(input).await.map(drop),
            Action::RemoveUser(input) => self.remove_user(input).await,
            Action::DeleteUser(input) => self.delete_user(input).await,
            Action::VerifyUser(input) => self.verify_user(input).await.map(drop),
            Action::RefreshLink(input) => self.refresh_link(input).await.map(drop),
            Action::AddLink(input) => self.add_link(input).await.map(drop),
            Action::RemoveLink(input) => self.remove_link(input).await,
        };
        if let Err(err) = &result {
            warn!(action = name, error = %err, "Action failed");
        }
        result
    }

    /// Grant a principal access at a link upstream and record it.
    pub async fn add_user(&self, input: AddUserInput) -> SyncResult<Permission> {
        // 1. Validate before anything reaches the lanes.
        let link = require_link(&input.link)?;
        require("username", &input.username)?;
        require_user_id(input.user_id)?;
        require_access_level(&input.access_level)?;
        info!(
            request_id = %input.request_id,
            link = %link,
            username = %input.username,
            "Adding collaborator"
        );

        // 2. The resource must be indexed locally and known upstream.
        let resource = self.indexed_resource(&link).await?;
        let kind = self.resolve_kind(Priority::Normal, &link).await?;

        // 3. Reject principals that already have access.
        if self
            .upstream
            .check_collaborator(Priority::Normal, &link, kind, &input.username)
            .await?
            .is_some()
        {
            return Err(SyncError::AlreadyExists {
                entity: format!("collaborator `{}` at `{link}`", input.username),
            });
        }

        // 4. Grant upstream.
        let granted = self
            .upstream
            .add_collaborator(
                Priority::Normal,
                &link,
                kind,
                &input.username,
                &input.access_level,
            )
            .await?
            .ok_or_else(|| {
                SyncError::Upstream(format!("`{}` was not added to `{link}`", input.username))
            })?;
        let access_level = if granted.access_level.is_empty() {
            input.access_level.clone()
        } else {
            granted.access_level.clone()
        };

        // 5. Record the user and the permission, then derive the tree.
        let principal_id = granted.principal_id;
        let (user_id, resource_kind) = (input.user_id, resource.kind);
        let (link_ref, granted, access_level) = (&link, &granted, &access_level);
        let (user, permission) = retry_conflicts("add_user", move || async move {
            let now = Utc::now();
            let mut tx = self.store.begin();
            let user = UpsertUser {
                principal_id,
                user_id: Some(user_id),
                username: granted.username.clone(),
                avatar_url: granted.avatar_url.clone(),
            }
            .apply(tx.user(principal_id).await?, now);
            tx.put_user(user.clone());

            let existing = tx.permission(principal_id, link_ref).await?;
            tx.put_permission(
                UpsertPermission {
                    principal_id,
                    user_id: Some(user_id),
                    username: granted.username.clone(),
                    resource_link: link_ref.clone(),
                    resource_kind,
                    access_level: access_level.clone(),
                    avatar_url: granted.avatar_url.clone(),
                    expires_at: None,
                }
                .apply(existing, now),
            );
            backfill_user_id(&mut tx, principal_id, user_id).await?;
            reconcile_permission(&mut tx, principal_id, link_ref).await?;
            let permission = tx
                .permission(principal_id, link_ref)
                .await?
                .ok_or_else(|| SyncError::Internal("staged permission vanished".into()))?;
            tx.commit().await?;
            Ok::<_, SyncError>((user, permission))
        })
        .await?;

        // 6. A verified principal needs no invitation.
        self.notify(
            &input.request_id,
            UnverifiedPayload::delete_users(vec![UnverifiedUser::new(&user, "")]),
        )
        .await;
        info!(request_id = %input.request_id, link = %link, principal_id, "Collaborator added");
        Ok(permission)
    }

    /// Change the access level of an existing collaborator.
    pub async fn update_user(&self, input: UpdateUserInput) -> SyncResult<Permission> {
        let link = require_link(&input.link)?;
        require("username", &input.username)?;
        require_access_level(&input.access_level)?;
        info!(
            request_id = %input.request_id,
            link = %link,
            username = %input.username,
            access_level = %input.access_level,
            "Updating collaborator"
        );

        // 1. The principal must be known here and upstream.
        let user = self
            .store
            .users()
            .get_by_username(&input.username)
            .await?
            .ok_or_else(|| SyncError::not_found("user", &input.username))?;
        let profile = self
            .upstream
            .get_user(Priority::Normal, &input.username)
            .await?
            .ok_or_else(|| SyncError::not_found("upstream user", &input.username))?;

        // 2. And must already be a collaborator at the link.
        let resource = self.indexed_resource(&link).await?;
        let kind = self.resolve_kind(Priority::Normal, &link).await?;
        if self
            .upstream
            .check_collaborator(Priority::Normal, &link, kind, &input.username)
            .await?
            .is_none()
        {
            return Err(SyncError::not_found(
                "collaborator",
                format!("{} at {link}", input.username),
            ));
        }

        // 3. Update upstream, then the row.
        let updated = self
            .upstream
            .update_collaborator(
                Priority::Normal,
                &link,
                kind,
                &input.username,
                &input.access_level,
            )
            .await?;
        let access_level = updated
            .map(|c| c.access_level)
            .filter(|level| !level.is_empty())
            .unwrap_or(input.access_level);

        let principal_id = profile.principal_id;
        let (user_id, resource_kind) = (user.user_id, resource.kind);
        let (link_ref, profile, access_level) = (&link, &profile, &access_level);
        let permission = retry_conflicts("update_user", move || async move {
            let now = Utc::now();
            let mut tx = self.store.begin();
            let existing = tx.permission(principal_id, link_ref).await?;
            tx.put_permission(
                UpsertPermission {
                    principal_id,
                    user_id,
                    username: profile.username.clone(),
                    resource_link: link_ref.clone(),
                    resource_kind,
                    access_level: access_level.clone(),
                    avatar_url: profile.avatar_url.clone(),
                    expires_at: None,
                }
                .apply(existing, now),
            );
            reconcile_permission(&mut tx, principal_id, link_ref).await?;
            let permission = tx
                .permission(principal_id, link_ref)
                .await?
                .ok_or_else(|| SyncError::Internal("staged permission vanished".into()))?;
            tx.commit().await?;
            Ok::<_, SyncError>(permission)
        })
        .await?;

        info!(request_id = %input.request_id, link = %link, principal_id, "Collaborator updated");
        Ok(permission)
    }

    /// Revoke a principal's access at a link, including everything it held
    /// below that link.
    pub async fn remove_user(&self, input: RemoveUserInput) -> SyncResult<()> {
        let link = require_link(&input.link)?;
        require("username", &input.username)?;
        info!(
            request_id = %input.request_id,
            link = %link,
            username = %input.username,
            "Removing collaborator"
        );

        let user = self
            .store
            .users()
            .get_by_username(&input.username)
            .await?
            .ok_or_else(|| SyncError::not_found("user", &input.username))?;
        self.upstream
            .get_user(Priority::Normal, &input.username)
            .await?
            .ok_or_else(|| SyncError::not_found("upstream user", &input.username))?;
        let kind = self.resolve_kind(Priority::Normal, &link).await?;

        self.upstream
            .remove_collaborator(Priority::Normal, &link, kind, &input.username)
            .await?;

        let principal_id = user.principal_id;
        let link_ref = &link;
        let (removed, dropped) = retry_conflicts("remove_user", move || async move {
            let mut tx = self.store.begin();
            let removed = remove_permission(&mut tx, principal_id, link_ref).await?;
            let dropped = drop_orphan_users(&mut tx, [principal_id]).await?;
            tx.commit().await?;
            Ok::<_, SyncError>((removed, dropped))
        })
        .await?;

        self.notify_dropped(&input.request_id, &dropped).await;
        info!(
            request_id = %input.request_id,
            link = %link,
            principal_id,
            removed,
            user_removed = !dropped.is_empty(),
            "Collaborator removed"
        );
        Ok(())
    }

    /// Remove a principal from every resource upstream and forget it.
    pub async fn delete_user(&self, input: DeleteUserInput) -> SyncResult<()> {
        require("username", &input.username)?;
        info!(request_id = %input.request_id, username = %input.username, "Deleting user");

        let local = self
            .store
            .users()
            .get_by_username(&input.username)
            .await?;
        let profile = self
            .upstream
            .get_user(Priority::Normal, &input.username)
            .await?;
        let principal_id = profile
            .map(|p| p.principal_id)
            .or(local.as_ref().map(|u| u.principal_id))
            .ok_or_else(|| SyncError::not_found("user", &input.username))?;

        // 1. Revoke upstream wherever access is still present.
        let held = self
            .store
            .permissions()
            .select(&PermissionQuery {
                principal_id: Some(principal_id),
                placeholder: Some(false),
                ..PermissionQuery::default()
            })
            .await?;
        for permission in &held {
            let present = self
                .upstream
                .check_collaborator(
                    Priority::Normal,
                    &permission.resource_link,
                    permission.resource_kind,
                    &input.username,
                )
                .await?;
            if present.is_some() {
                self.upstream
                    .remove_collaborator(
                        Priority::Normal,
                        &permission.resource_link,
                        permission.resource_kind,
                        &input.username,
                    )
                    .await?;
                debug!(principal_id, link = %permission.resource_link, "Access revoked upstream");
            }
        }

        // 2. Forget every row of the principal.
        let dropped = retry_conflicts("delete_user", move || async move {
            let mut tx = self.store.begin();
            let rows = tx
                .select_permissions(&PermissionQuery::for_principal(principal_id))
                .await?;
            for permission in rows {
                tx.delete_permission(permission.key());
            }
            let dropped = drop_orphan_users(&mut tx, [principal_id]).await?;
            tx.commit().await?;
            Ok::<_, SyncError>(dropped)
        })
        .await?;

        self.notify_dropped(&input.request_id, &dropped).await;
        info!(
            request_id = %input.request_id,
            principal_id,
            revoked = held.len(),
            "User deleted"
        );
        Ok(())
    }

    /// Bind a principal to its internal identity.
    pub async fn verify_user(&self, input: VerifyUserInput) -> SyncResult<User> {
        require("username", &input.username)?;
        require_user_id(input.user_id)?;
        info!(
            request_id = %input.request_id,
            username = %input.username,
            user_id = input.user_id,
            "Verifying user"
        );

        let profile = self
            .upstream
            .get_user(Priority::Normal, &input.username)
            .await?
            .ok_or_else(|| SyncError::not_found("upstream user", &input.username))?;

        let user_id = input.user_id;
        let profile = &profile;
        let (user, updated) = retry_conflicts("verify_user", move || async move {
            let now = Utc::now();
            let mut tx = self.store.begin();
            let user = UpsertUser {
                principal_id: profile.principal_id,
                user_id: Some(user_id),
                username: profile.username.clone(),
                avatar_url: profile.avatar_url.clone(),
            }
            .apply(tx.user(profile.principal_id).await?, now);
            tx.put_user(user.clone());
            let updated = backfill_user_id(&mut tx, profile.principal_id, user_id).await?;
            tx.commit().await?;
            Ok::<_, SyncError>((user, updated))
        })
        .await?;

        self.notify(
            &input.request_id,
            UnverifiedPayload::delete_users(vec![UnverifiedUser::new(&user, "")]),
        )
        .await;
        info!(
            request_id = %input.request_id,
            principal_id = user.principal_id,
            permissions = updated,
            "User verified"
        );
        Ok(user)
    }

    /// Re-read the members of one indexed link and publish the unverified
    /// principals found there.
    pub async fn refresh_link(&self, input: LinkInput) -> SyncResult<Vec<User>> {
        let link = require_link(&input.link)?;
        info!(request_id = %input.request_id, link = %link, "Refreshing link");

        let resource = self.indexed_resource(&link).await?;
        let started = Utc::now();
        let observed = self.refresh_resource(&input.request_id, &resource).await?;
        self.publish_observed(&input.request_id, &observed, started)
            .await?;

        info!(
            request_id = %input.request_id,
            link = %link,
            members = observed.len(),
            "Link refreshed"
        );
        Ok(observed)
    }

    /// Start tracking a link and index its resources.
    pub async fn add_link(&self, input: LinkInput) -> SyncResult<Vec<Resource>> {
        let link = require_link(&input.link)?;
        info!(request_id = %input.request_id, link = %link, "Adding tracked link");

        // A link below a tracked organization is indexed with it.
        let tracked = self.store.links().list().await?;
        if let Some(covering) = tracked.iter().find(|t| link_is_under(&link, &t.link)) {
            return Err(SyncError::AlreadyExists {
                entity: if covering.link == link {
                    format!("tracked link `{link}`")
                } else {
                    format!("tracked link `{}` covering `{link}`", covering.link)
                },
            });
        }
        let resources = self.index_link(Priority::Normal, &link).await?;
        self.store.links().add(&link).await?;

        info!(
            request_id = %input.request_id,
            link = %link,
            resources = resources.len(),
            "Tracked link added"
        );
        Ok(resources)
    }

    /// Stop tracking a link and drop its resources and their permissions.
    pub async fn remove_link(&self, input: LinkInput) -> SyncResult<()> {
        let link = require_link(&input.link)?;
        info!(request_id = %input.request_id, link = %link, "Removing tracked link");

        if self.store.links().get(&link).await?.is_none() {
            return Err(SyncError::not_found("tracked link", &link));
        }

        let link_ref = &link;
        let (resources, permissions, dropped) = retry_conflicts("remove_link", move || async move {
            let mut tx = self.store.begin();
            let mut principals = BTreeSet::new();
            let permissions = tx
                .select_permissions(&PermissionQuery {
                    under_link: Some(link_ref.clone()),
                    ..PermissionQuery::default()
                })
                .await?;
            for permission in &permissions {
                principals.insert(permission.principal_id);
                tx.delete_permission(permission.key());
            }
            let resources = tx.select_resources(&ResourceQuery::under(link_ref)).await?;
            for resource in &resources {
                tx.delete_resource(resource.id);
            }
            let dropped = drop_orphan_users(&mut tx, principals).await?;
            tx.commit().await?;
            Ok::<_, SyncError>((resources.len(), permissions.len(), dropped))
        })
        .await?;
        self.store.links().remove(&link).await?;

        self.notify_dropped(&input.request_id, &dropped).await;
        info!(
            request_id = %input.request_id,
            link = %link,
            resources,
            permissions,
            "Tracked link removed"
        );
        Ok(())
    }

    // -- shared with the worker ---------------------------------------------

    /// Resolve a link upstream and upsert its resource; organizations also
    /// get their repositories. Resources below the link that disappeared
    /// upstream are dropped together with their permissions.
    pub async fn index_link(&self, priority: Priority, link: &str) -> SyncResult<Vec<Resource>> {
        let info = self
            .upstream
            .find_link(priority, link)
            .await?
            .ok_or_else(|| SyncError::not_found("link", link))?;

        let top = match self.store.resources().get_by_id(info.id).await? {
            // Already indexed below its organization: keep it there.
            Some(existing)
                if existing.parent_id.is_some() && existing.link == normalize_link(link) =>
            {
                existing
            }
            _ => Resource::root(info.id, link, info.kind),
        };
        let mut resources = vec![top.clone()];
        if info.kind == ResourceKind::Organization {
            for repository in self
                .upstream
                .list_repositories(priority, &top.link)
                .await?
            {
                resources.push(top.child_repository(repository.id, &repository.path));
            }
        }

        let (top_ref, kept) = (&top, &resources);
        retry_conflicts("index_link", move || async move {
            let mut tx = self.store.begin();
            // Ids no longer listed, including a root re-created under a new id.
            let stale: Vec<_> = tx
                .select_resources(&ResourceQuery::under(&top_ref.link))
                .await?
                .into_iter()
                .filter(|r| kept.iter().all(|k| k.id != r.id))
                .collect();
            for resource in stale {
                if kept.iter().all(|k| k.link != resource.link) {
                    let holders = tx
                        .select_permissions(&PermissionQuery::at_link(&resource.link))
                        .await?;
                    for permission in holders {
                        remove_permission(&mut tx, permission.principal_id, &resource.link)
                            .await?;
                    }
                }
                debug!(link = %resource.link, id = resource.id, "Resource gone upstream");
                tx.delete_resource(resource.id);
            }
            for resource in kept {
                // A link taken over by a different upstream id.
                let previous = tx.resource_by_link(&resource.link).await?;
                if let Some(previous) = previous.filter(|p| p.id != resource.id) {
                    tx.delete_resource(previous.id);
                }
                if tx.resource_by_id(resource.id).await?.as_ref() != Some(resource) {
                    tx.put_resource(resource.clone());
                }
            }
            tx.commit().await
        })
        .await?;

        debug!(link = %top.link, kind = %top.kind, resources = resources.len(), "Link indexed");
        Ok(resources)
    }

    /// Record every member of `resource` as seen now, one transaction per
    /// member. Returns the users observed.
    pub async fn refresh_resource(
        &self,
        request_id: &str,
        resource: &Resource,
    ) -> SyncResult<Vec<User>> {
        let members = self
            .upstream
            .list_members(Priority::Low, &resource.link, resource.kind)
            .await?;
        debug!(request_id, link = %resource.link, members = members.len(), "Members listed");

        let mut observed = Vec::with_capacity(members.len());
        for member in members {
            let access_level = match resource.kind {
                ResourceKind::Organization => self
                    .upstream
                    .check_collaborator(
                        Priority::Low,
                        &resource.link,
                        resource.kind,
                        &member.username,
                    )
                    .await?
                    .map(|c| c.access_level)
                    .unwrap_or_default(),
                ResourceKind::Repository => member.access_level.clone(),
            };
            if access_level.is_empty() || access_level == Permission::PLACEHOLDER_ACCESS_LEVEL {
                warn!(
                    request_id,
                    link = %resource.link,
                    principal_id = member.principal_id,
                    "Member without a usable role skipped"
                );
                continue;
            }

            let principal_id = member.principal_id;
            let (member, access_level) = (&member, &access_level);
            let user = retry_conflicts("refresh_resource", move || async move {
                let now = Utc::now();
                let mut tx = self.store.begin();
                let user = UpsertUser {
                    principal_id,
                    user_id: None,
                    username: member.username.clone(),
                    avatar_url: member.avatar_url.clone(),
                }
                .apply(tx.user(principal_id).await?, now);
                tx.put_user(user.clone());

                let existing = tx.permission(principal_id, &resource.link).await?;
                tx.put_permission(
                    UpsertPermission {
                        principal_id,
                        user_id: user.user_id,
                        username: member.username.clone(),
                        resource_link: resource.link.clone(),
                        resource_kind: resource.kind,
                        access_level: access_level.clone(),
                        avatar_url: member.avatar_url.clone(),
                        expires_at: None,
                    }
                    .apply(existing, now),
                );
                reconcile_permission(&mut tx, principal_id, &resource.link).await?;
                tx.commit().await?;
                Ok::<_, SyncError>(user)
            })
            .await?;
            observed.push(user);
        }
        Ok(observed)
    }

    /// Send `set_users` for the unverified users among `users` that hold a
    /// root permission refreshed since `since`. The submodule is the link
    /// of that permission.
    pub async fn publish_observed(
        &self,
        request_id: &str,
        users: &[User],
        since: DateTime<Utc>,
    ) -> SyncResult<usize> {
        let mut seen = BTreeSet::new();
        let mut unverified = Vec::new();
        for user in users {
            if user.is_verified() || !seen.insert(user.principal_id) {
                continue;
            }
            let roots = self
                .store
                .permissions()
                .select(&PermissionQuery {
                    principal_id: Some(user.principal_id),
                    placeholder: Some(false),
                    roots_only: true,
                    updated_since: Some(since),
                    ..PermissionQuery::default()
                })
                .await?;
            if let Some(root) = roots.first() {
                unverified.push(UnverifiedUser::new(user, &root.resource_link));
            }
        }

        let published = unverified.len();
        if published > 0 {
            self.notify(request_id, UnverifiedPayload::set_users(unverified))
                .await;
        }
        Ok(published)
    }

    /// Send `delete_users` for the unverified users among `dropped`.
    pub async fn notify_dropped(&self, request_id: &str, dropped: &[User]) {
        let users: Vec<_> = dropped
            .iter()
            .filter(|u| !u.is_verified())
            .map(|u| UnverifiedUser::new(u, ""))
            .collect();
        if !users.is_empty() {
            self.notify(request_id, UnverifiedPayload::delete_users(users))
                .await;
        }
    }

    async fn notify(&self, request_id: &str, payload: UnverifiedPayload) {
        let action = payload.action.as_str();
        let users = payload.users.len();
        if let Err(err) = self.notifier.publish(request_id, payload).await {
            error!(request_id, action, users, error = %err, "Failed to notify identity service");
        }
    }

    async fn indexed_resource(&self, link: &str) -> SyncResult<Resource> {
        self.store
            .resources()
            .get_by_link(link)
            .await?
            .ok_or_else(|| SyncError::not_found("resource", link))
    }

    async fn resolve_kind(&self, priority: Priority, link: &str) -> SyncResult<ResourceKind> {
        self.upstream
            .find_link(priority, link)
            .await?
            .map(|info| info.kind)
            .ok_or_else(|| SyncError::not_found("link", link))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn link_validation_normalizes_and_rejects_blanks() {
        assert_eq!(require_link(" /Acme/Widgets ").unwrap(), "acme/widgets");
        assert!(require_link("   ").unwrap_err().is_bad_request());
        assert!(require_link("acme//widgets").unwrap_err().is_bad_request());
    }

    #[test]
    fn placeholder_level_cannot_be_granted() {
        assert!(require_access_level(Permission::PLACEHOLDER_ACCESS_LEVEL).is_err());
        assert!(require_access_level("").is_err());
        assert!(require_access_level("write").is_ok());
    }

    #[test]
    fn actions_deserialize_from_tagged_messages() {
        let action: Action = serde_json::from_value(serde_json::json!({
            "action": "remove_user",
            "request_id": "req-1",
            "link": "acme/widgets",
            "username": "octocat",
        }))
        .unwrap();
        assert_eq!(action.name(), "remove_user");
        assert!(matches!(action, Action::RemoveUser(input) if input.username == "octocat"));
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_commit() {
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let result = retry_conflicts("unit", move || async move {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(SyncError::Conflict("stale".into())),
                n => Ok(n),
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn retries_stop_at_the_attempt_limit_and_on_other_errors() {
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let result: SyncResult<()> = retry_conflicts("unit", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Conflict("stale".into()))
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(attempts.into_inner(), COMMIT_ATTEMPTS);

        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let result: SyncResult<()> = retry_conflicts("unit", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Internal("broken".into()))
        })
        .await;
        assert!(!result.unwrap_err().is_retryable());
        assert_eq!(attempts.into_inner(), 1);
    }
}
