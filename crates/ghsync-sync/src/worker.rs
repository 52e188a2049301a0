//! Periodic reconciliation of the local permission tree with upstream.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ghsync_core::error::{SyncError, SyncResult};
use ghsync_core::models::resource::link_depth;
use ghsync_core::models::user::User;
use ghsync_core::repository::{
    LinkRepository, PermissionQuery, PermissionRepository, Store, UserQuery,
};
use ghsync_scheduler::Priority;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::notifier::UnverifiedNotifier;
use crate::processor::{Processor, drop_orphan_users, retry_conflicts};
use crate::synchronizer::{prune_placeholders, reconcile_permission, remove_permission};
use crate::upstream::UpstreamClient;

pub struct Worker<S, C, N> {
    pub(crate) processor: Processor<S, C, N>,
    pub(crate) config: WorkerConfig,
    last_pass: Arc<Mutex<Option<Duration>>>,
}

impl<S, C, N> Clone for Worker<S, C, N> {
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            config: self.config.clone(),
            last_pass: self.last_pass.clone(),
        }
    }
}

impl<S, C, N> Worker<S, C, N>
where
    S: Store + 'static,
    C: UpstreamClient,
    N: UnverifiedNotifier,
{
    pub fn new(processor: Processor<S, C, N>, config: WorkerConfig) -> Self {
        Self {
            processor,
            config,
            last_pass: Arc::new(Mutex::new(None)),
        }
    }

    /// Wall-clock duration of the last successful pass.
    pub fn last_pass(&self) -> Option<Duration> {
        *self.last_pass.lock()
    }

    /// Run passes until `shutdown` flips to `true`. A failed pass is logged
    /// and retried after the configured backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            backoff_secs = self.config.backoff_secs,
            "Reconciliation worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.process_permissions().await {
                Ok(_) => self.config.interval(),
                Err(err) => {
                    error!(
                        error = %err,
                        backoff_secs = self.config.backoff_secs,
                        "Reconciliation pass failed"
                    );
                    self.config.backoff()
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Reconciliation worker stopped");
    }

    /// One full pass over every tracked link. Returns its duration.
    pub async fn process_permissions(&self) -> SyncResult<Duration> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let pass_start = Utc::now();
        let store = self.processor.store();
        info!(request_id = %request_id, "Reconciliation pass started");

        // 1. Index the forest below every tracked link.
        let links = store.links().list().await?;
        let mut resources = Vec::new();
        for tracked in &links {
            match self.processor.index_link(Priority::Low, &tracked.link).await {
                Ok(indexed) => resources.extend(indexed),
                Err(SyncError::NotFound { .. }) => {
                    warn!(
                        request_id = %request_id,
                        link = %tracked.link,
                        "Tracked link not found upstream, skipped"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        // 2. Observe members, roots first.
        resources.sort_by_key(|r| (r.depth(), r.id));
        resources.dedup_by_key(|r| r.id);
        let mut observed = Vec::new();
        for resource in &resources {
            observed.extend(self.processor.refresh_resource(&request_id, resource).await?);
        }
        info!(
            request_id = %request_id,
            links = links.len(),
            resources = resources.len(),
            observed = observed.len(),
            "Members observed"
        );

        // 3. Expire what was not seen and what ran out.
        let expired = self.expire(pass_start).await?;

        // 4. Re-derive the tree, deepest first.
        let rederived = self.rederive().await?;

        // 5. Prune placeholders and users left without access.
        let (pruned, dropped) = self.prune().await?;
        self.processor.notify_dropped(&request_id, &dropped).await;

        // 6. Invite the unverified principals seen in this pass.
        let published = self
            .processor
            .publish_observed(&request_id, &observed, pass_start)
            .await?;

        let elapsed = started.elapsed();
        *self.last_pass.lock() = Some(elapsed);
        info!(
            request_id = %request_id,
            expired,
            rederived,
            pruned,
            users_removed = dropped.len(),
            published,
            elapsed_ms = elapsed.as_millis() as u64,
            "Reconciliation pass finished"
        );
        Ok(elapsed)
    }

    async fn expire(&self, pass_start: DateTime<Utc>) -> SyncResult<usize> {
        retry_conflicts("expire", move || async move {
            let mut tx = self.processor.store().begin();
            let absent = tx
                .select_permissions(&PermissionQuery {
                    placeholder: Some(false),
                    updated_before: Some(pass_start),
                    ..PermissionQuery::default()
                })
                .await?;
            let lapsed = tx
                .select_permissions(&PermissionQuery {
                    expired_at: Some(Utc::now()),
                    ..PermissionQuery::default()
                })
                .await?;

            let mut expired = 0;
            for permission in absent.into_iter().chain(lapsed) {
                let key = permission.key();
                if tx
                    .permission(key.principal_id, &key.resource_link)
                    .await?
                    .is_none()
                {
                    continue;
                }
                debug!(
                    principal_id = key.principal_id,
                    link = %key.resource_link,
                    "Permission expired"
                );
                tx.delete_permission(key);
                expired += 1;
            }
            tx.commit().await?;
            Ok::<_, SyncError>(expired)
        })
        .await
    }

    /// Re-derive every principal's tree, one transaction per principal.
    async fn rederive(&self) -> SyncResult<usize> {
        let principals: BTreeSet<i64> = self
            .processor
            .store()
            .permissions()
            .select(&PermissionQuery::default())
            .await?
            .into_iter()
            .map(|p| p.principal_id)
            .collect();

        let mut rederived = 0;
        for principal_id in principals {
            rederived += retry_conflicts("rederive", move || {
                self.rederive_principal(principal_id)
            })
            .await?;
        }
        Ok(rederived)
    }

    async fn rederive_principal(&self, principal_id: i64) -> SyncResult<usize> {
        let mut tx = self.processor.store().begin();
        let mut permissions = tx
            .select_permissions(&PermissionQuery::for_principal(principal_id))
            .await?;
        // Deepest first.
        permissions.sort_by_key(|p| std::cmp::Reverse(link_depth(&p.resource_link)));

        let mut rederived = 0;
        for permission in permissions {
            let link = permission.resource_link;
            if tx.permission(principal_id, &link).await?.is_none() {
                continue;
            }
            if tx.resource_by_link(&link).await?.is_none() {
                warn!(principal_id, link = %link, "Permission without resource dropped");
                remove_permission(&mut tx, principal_id, &link).await?;
                continue;
            }
            reconcile_permission(&mut tx, principal_id, &link).await?;
            rederived += 1;
        }
        tx.commit().await?;
        Ok(rederived)
    }

    async fn prune(&self) -> SyncResult<(usize, Vec<User>)> {
        retry_conflicts("prune", move || async move {
            let mut tx = self.processor.store().begin();
            let pruned = prune_placeholders(&mut tx, None).await?;
            let principals: BTreeSet<i64> = tx
                .select_users(&UserQuery::default())
                .await?
                .into_iter()
                .map(|u| u.principal_id)
                .collect();
            let dropped = drop_orphan_users(&mut tx, principals).await?;
            tx.commit().await?;
            Ok::<_, SyncError>((pruned, dropped))
        })
        .await
    }
}
