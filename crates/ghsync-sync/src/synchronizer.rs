//! Derivation of the permission hierarchy.
//!
//! For every permission the synchronizer maintains `parent_link` (the
//! nearest ancestor resource where the same principal holds a permission),
//! `has_parent` (that ancestor grants the same access level) and
//! `has_child` (some descendant grants a different one). When a principal
//! has access below an ancestor it is not indexed at, a placeholder row is
//! synthesized there so the chain stays connected.
//!
//! All functions work inside a [`Transaction`]; nothing is visible to
//! other readers until the caller commits.

use std::collections::HashSet;

use chrono::Utc;
use ghsync_core::error::{SyncError, SyncResult};
use ghsync_core::models::permission::{Permission, PermissionKey};
use ghsync_core::models::resource::Resource;
use ghsync_core::repository::{PermissionQuery, Store};
use ghsync_core::transaction::Transaction;
use tracing::debug;

/// Longest chain of resources walked before the tree is treated as
/// malformed.
pub const MAX_TREE_DEPTH: usize = 50;

fn consistency(message: impl Into<String>) -> SyncError {
    SyncError::Consistency(message.into())
}

/// Nodes seen by one tree walk.
#[derive(Default)]
struct Visited(HashSet<String>);

impl Visited {
    fn new(start: &str) -> Self {
        Self(HashSet::from([start.to_string()]))
    }

    fn enter(&mut self, link: &str, depth: usize) -> SyncResult<()> {
        if depth > MAX_TREE_DEPTH {
            return Err(consistency(format!(
                "tree deeper than {MAX_TREE_DEPTH} levels at `{link}`"
            )));
        }
        if !self.0.insert(link.to_string()) {
            return Err(consistency(format!("tree walk revisits `{link}`")));
        }
        Ok(())
    }
}

/// Re-derive the hierarchy around the permission of `principal_id` at
/// `resource_link`. Call it right after the row was staged.
pub async fn reconcile_permission<S: Store>(
    tx: &mut Transaction<'_, S>,
    principal_id: i64,
    resource_link: &str,
) -> SyncResult<()> {
    let resource = tx
        .resource_by_link(resource_link)
        .await?
        .ok_or_else(|| consistency(format!("no resource at `{resource_link}`")))?;
    let original = tx
        .permission(principal_id, resource_link)
        .await?
        .ok_or_else(|| {
            consistency(format!(
                "no permission of principal {principal_id} at `{resource_link}`"
            ))
        })?;
    let mut permission = original.clone();

    match resource.parent_id {
        None => {
            permission.parent_link = None;
            permission.has_parent = false;
        }
        Some(parent_id) => {
            let parent = tx.resource_by_id(parent_id).await?.ok_or_else(|| {
                consistency(format!("parent {parent_id} of `{resource_link}` is missing"))
            })?;
            if parent.id == resource.id {
                return Err(consistency(format!("`{resource_link}` is its own parent")));
            }
            match tx.permission(principal_id, &parent.link).await? {
                Some(ancestor) => {
                    permission.has_parent = ancestor.access_level == permission.access_level;
                }
                None => {
                    synthesize_placeholders(tx, &permission, &resource, parent.clone()).await?;
                    permission.has_parent = false;
                }
            }
            permission.parent_link = Some(parent.link);
        }
    }

    permission.has_child = has_divergent_descendant(tx, &permission).await?;
    if permission != original {
        debug!(
            principal_id,
            link = %resource_link,
            parent_link = ?permission.parent_link,
            has_parent = permission.has_parent,
            has_child = permission.has_child,
            "Permission flags derived"
        );
        tx.put_permission(permission.clone());
    }

    refresh_children(tx, &permission).await?;
    refresh_ancestors(tx, principal_id, permission.parent_link.clone()).await
}

/// Delete the permission and every permission of the same principal that
/// hangs below it, then fix up or prune what is left above it. Returns the
/// number of rows removed.
pub async fn remove_permission<S: Store>(
    tx: &mut Transaction<'_, S>,
    principal_id: i64,
    resource_link: &str,
) -> SyncResult<usize> {
    let Some(permission) = tx.permission(principal_id, resource_link).await? else {
        return Ok(0);
    };

    let mut visited = Visited::new(resource_link);
    let mut frontier = vec![(permission.resource_link.clone(), 0)];
    let mut removed = 0;
    while let Some((link, depth)) = frontier.pop() {
        for child in tx
            .select_permissions(&PermissionQuery::children_of(principal_id, &link))
            .await?
        {
            visited.enter(&child.resource_link, depth + 1)?;
            frontier.push((child.resource_link, depth + 1));
        }
        tx.delete_permission(PermissionKey::new(principal_id, &link));
        debug!(principal_id, link = %link, "Permission removed");
        removed += 1;
    }

    if let Some(parent_link) = permission.parent_link {
        removed += prune_upward(tx, principal_id, &parent_link).await?;
    }
    Ok(removed)
}

/// Delete placeholders that no longer have anything below them. Limited
/// to one principal when `principal_id` is set. Returns the number of
/// rows removed.
pub async fn prune_placeholders<S: Store>(
    tx: &mut Transaction<'_, S>,
    principal_id: Option<i64>,
) -> SyncResult<usize> {
    let query = PermissionQuery {
        principal_id,
        placeholder: Some(true),
        ..PermissionQuery::default()
    };
    let mut pruned = 0;
    for placeholder in tx.select_permissions(&query).await? {
        // An earlier prune in this loop may have removed it already.
        if tx
            .permission(placeholder.principal_id, &placeholder.resource_link)
            .await?
            .is_none()
        {
            continue;
        }
        pruned += prune_upward(tx, placeholder.principal_id, &placeholder.resource_link).await?;
    }
    Ok(pruned)
}

/// Stage placeholders from `start` upward until the root or a level where
/// the principal already holds a permission.
async fn synthesize_placeholders<S: Store>(
    tx: &mut Transaction<'_, S>,
    template: &Permission,
    origin: &Resource,
    start: Resource,
) -> SyncResult<()> {
    let now = Utc::now();
    let mut visited = Visited::new(&origin.link);
    let mut level = start;
    let mut depth = 1;

    loop {
        visited.enter(&level.link, depth)?;
        let Some(parent_id) = level.parent_id else {
            debug!(
                principal_id = template.principal_id,
                link = %level.link,
                "Root placeholder synthesized"
            );
            tx.put_permission(Permission::placeholder(template, &level, None, now));
            return Ok(());
        };

        let parent = tx.resource_by_id(parent_id).await?.ok_or_else(|| {
            consistency(format!("parent {parent_id} of `{}` is missing", level.link))
        })?;
        let mut placeholder =
            Permission::placeholder(template, &level, Some(parent.link.clone()), now);
        debug!(
            principal_id = template.principal_id,
            link = %level.link,
            "Placeholder synthesized"
        );

        match tx.permission(template.principal_id, &parent.link).await? {
            Some(ancestor) => {
                placeholder.has_parent = ancestor.access_level == placeholder.access_level;
                tx.put_permission(placeholder);
                return Ok(());
            }
            None => {
                tx.put_permission(placeholder);
                level = parent;
                depth += 1;
            }
        }
    }
}

/// Whether any permission below `permission` grants a different level.
async fn has_divergent_descendant<S: Store>(
    tx: &Transaction<'_, S>,
    permission: &Permission,
) -> SyncResult<bool> {
    let mut visited = Visited::new(&permission.resource_link);
    let mut frontier = vec![(permission.resource_link.clone(), 0)];
    while let Some((link, depth)) = frontier.pop() {
        for child in tx
            .select_permissions(&PermissionQuery::children_of(permission.principal_id, &link))
            .await?
        {
            if child.access_level != permission.access_level {
                return Ok(true);
            }
            visited.enter(&child.resource_link, depth + 1)?;
            frontier.push((child.resource_link, depth + 1));
        }
    }
    Ok(false)
}

/// Align the `has_parent` flag of the direct children with `permission`.
async fn refresh_children<S: Store>(
    tx: &mut Transaction<'_, S>,
    permission: &Permission,
) -> SyncResult<()> {
    let children = tx
        .select_permissions(&PermissionQuery::children_of(
            permission.principal_id,
            &permission.resource_link,
        ))
        .await?;
    for mut child in children {
        let has_parent = child.access_level == permission.access_level;
        if child.has_parent != has_parent {
            child.has_parent = has_parent;
            tx.put_permission(child);
        }
    }
    Ok(())
}

/// Recompute `has_child` on `next` and every permission above it.
async fn refresh_ancestors<S: Store>(
    tx: &mut Transaction<'_, S>,
    principal_id: i64,
    mut next: Option<String>,
) -> SyncResult<()> {
    let mut visited = Visited::default();
    let mut depth = 0;
    while let Some(link) = next.take() {
        depth += 1;
        visited.enter(&link, depth)?;
        let Some(mut ancestor) = tx.permission(principal_id, &link).await? else {
            break;
        };
        let has_child = has_divergent_descendant(tx, &ancestor).await?;
        next = ancestor.parent_link.clone();
        if ancestor.has_child != has_child {
            ancestor.has_child = has_child;
            tx.put_permission(ancestor);
        }
    }
    Ok(())
}

/// Starting at `link`, delete placeholders left without children and
/// continue with their parents; the first surviving ancestor gets its
/// flags recomputed. Returns the number of rows removed.
async fn prune_upward<S: Store>(
    tx: &mut Transaction<'_, S>,
    principal_id: i64,
    link: &str,
) -> SyncResult<usize> {
    let mut visited = Visited::default();
    let mut next = Some(link.to_string());
    let mut depth = 0;
    let mut pruned = 0;

    while let Some(link) = next.take() {
        depth += 1;
        visited.enter(&link, depth)?;
        let Some(ancestor) = tx.permission(principal_id, &link).await? else {
            break;
        };
        let childless = tx
            .select_permissions(&PermissionQuery::children_of(principal_id, &link))
            .await?
            .is_empty();
        if ancestor.is_placeholder() && childless {
            debug!(principal_id, link = %link, "Childless placeholder pruned");
            tx.delete_permission(ancestor.key());
            pruned += 1;
            next = ancestor.parent_link;
            continue;
        }
        refresh_ancestors(tx, principal_id, Some(link)).await?;
        break;
    }
    Ok(pruned)
}
