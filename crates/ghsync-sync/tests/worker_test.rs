//! Reconciliation passes against a fake upstream and in-memory SurrealDB.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ghsync_core::models::permission::Permission;
use ghsync_core::models::resource::ResourceKind;
use ghsync_core::repository::{
    LinkRepository, PermissionQuery, PermissionRepository, ResourceRepository, Store,
    UserRepository,
};
use ghsync_scheduler::Lane;
use ghsync_sync::{
    Processor, ScheduledUpstream, UnverifiedAction, Worker, WorkerConfig, estimate_duration,
};
use tokio::sync::watch;

use common::{FakeUpstream, Harness, RecordingNotifier, TestStore, harness, seed_acme};

type TestWorker = Worker<TestStore, FakeUpstream, RecordingNotifier>;

async fn tracked(h: &Harness) -> TestWorker {
    seed_acme(&h.upstream);
    h.store.links().add("acme").await.unwrap();
    Worker::new(h.processor.clone(), WorkerConfig::default())
}

/// A worker sharing the harness store and lanes but reading `upstream`.
fn worker_over(h: &Harness, upstream: FakeUpstream) -> TestWorker {
    let processor = Processor::new(
        h.store.clone(),
        ScheduledUpstream::new(Arc::new(upstream), h.lanes.clone()),
        h.notifier.clone(),
    );
    Worker::new(processor, WorkerConfig::default())
}

async fn count(h: &Harness, query: &PermissionQuery) -> u64 {
    h.store.permissions().count(query).await.unwrap()
}

#[tokio::test]
async fn pass_builds_the_forest_and_tree() {
    let h = harness().await;
    let worker = tracked(&h).await;
    let hubot = h.upstream.user(42, "hubot");
    let octocat = h.upstream.user(7, "octocat");
    h.upstream.grant("acme", &hubot, "admin");
    h.upstream.grant("acme/widgets", &hubot, "read");
    h.upstream.grant("acme/tools", &octocat, "write");

    let elapsed = worker.process_permissions().await.unwrap();

    assert_eq!(worker.last_pass(), Some(elapsed));
    assert_eq!(
        h.store
            .resources()
            .get_by_link("acme/tools")
            .await
            .unwrap()
            .unwrap()
            .kind,
        ResourceKind::Repository
    );

    let acme = h.store.permissions().get(42, "acme").await.unwrap().unwrap();
    assert!(acme.has_child);
    let widgets = h.store.permissions().get(42, "acme/widgets").await.unwrap().unwrap();
    assert_eq!(widgets.parent_link.as_deref(), Some("acme"));
    assert!(!widgets.has_parent);

    let placeholder = h.store.permissions().get(7, "acme").await.unwrap().unwrap();
    assert!(placeholder.is_placeholder());

    // Only hubot holds a root permission.
    assert_eq!(
        h.notifier.usernames(UnverifiedAction::SetUsers),
        vec!["hubot"]
    );
}

#[tokio::test]
async fn second_pass_is_stable() {
    let h = harness().await;
    let worker = tracked(&h).await;
    let hubot = h.upstream.user(42, "hubot");
    h.upstream.grant("acme", &hubot, "admin");
    h.upstream.grant("acme/widgets", &hubot, "admin");

    worker.process_permissions().await.unwrap();
    let first: Vec<_> = h
        .store
        .permissions()
        .select(&PermissionQuery::for_principal(42))
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.resource_link, p.parent_link, p.has_parent, p.has_child))
        .collect();

    worker.process_permissions().await.unwrap();
    let second: Vec<_> = h
        .store
        .permissions()
        .select(&PermissionQuery::for_principal(42))
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.resource_link, p.parent_link, p.has_parent, p.has_child))
        .collect();

    assert_eq!(first, second);
    assert_eq!(
        second,
        vec![
            ("acme".to_string(), None, false, false),
            ("acme/widgets".to_string(), Some("acme".to_string()), true, false),
        ]
    );
}

#[tokio::test]
async fn access_missing_upstream_expires() {
    let h = harness().await;
    let worker = tracked(&h).await;
    let hubot = h.upstream.user(42, "hubot");
    let octocat = h.upstream.user(7, "octocat");
    h.upstream.grant("acme/widgets", &hubot, "write");
    h.upstream.grant("acme/tools", &octocat, "read");
    worker.process_permissions().await.unwrap();
    assert_eq!(count(&h, &PermissionQuery::for_principal(7)).await, 2);

    h.upstream.revoke("acme/tools", "octocat");
    tokio::time::sleep(Duration::from_millis(10)).await;
    worker.process_permissions().await.unwrap();

    // The concrete row expired and its placeholder was pruned.
    assert_eq!(count(&h, &PermissionQuery::for_principal(7)).await, 0);
    assert!(h.store.users().get_by_principal(7).await.unwrap().is_none());
    assert_eq!(
        h.notifier.usernames(UnverifiedAction::DeleteUsers),
        vec!["octocat"]
    );
    // Untouched principals survive.
    assert_eq!(count(&h, &PermissionQuery::for_principal(42)).await, 2);
}

#[tokio::test]
async fn lapsed_expiry_is_honoured() {
    let h = harness().await;
    let worker = tracked(&h).await;
    worker.process_permissions().await.unwrap();

    let now = Utc::now();
    let mut tx = h.store.begin();
    tx.put_permission(Permission {
        principal_id: 99,
        user_id: Some(3),
        username: "temp".into(),
        resource_link: "acme".into(),
        resource_kind: ResourceKind::Organization,
        access_level: "read".into(),
        parent_link: None,
        has_parent: false,
        has_child: false,
        avatar_url: String::new(),
        created_at: now,
        updated_at: now + chrono::Duration::hours(1),
        expires_at: Some(now - chrono::Duration::minutes(1)),
        version: 0,
    });
    tx.commit().await.unwrap();

    worker.process_permissions().await.unwrap();

    assert!(h.store.permissions().get(99, "acme").await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_tracked_links_are_skipped() {
    let h = harness().await;
    let worker = tracked(&h).await;
    h.store.links().add("globex").await.unwrap();
    let hubot = h.upstream.user(42, "hubot");
    h.upstream.grant("acme", &hubot, "member");

    worker.process_permissions().await.unwrap();

    assert!(h.store.permissions().get(42, "acme").await.unwrap().is_some());
    assert!(h.store.resources().get_by_link("globex").await.unwrap().is_none());
}

#[tokio::test]
async fn repositories_gone_upstream_are_dropped() {
    let h = harness().await;
    let worker = tracked(&h).await;
    let hubot = h.upstream.user(42, "hubot");
    h.upstream.grant("acme/tools", &hubot, "write");
    worker.process_permissions().await.unwrap();

    // Rebuild the upstream without `tools`.
    let upstream_without_tools = FakeUpstream::default();
    upstream_without_tools.organization(1, "acme");
    upstream_without_tools.repository("acme", 10, "widgets");
    worker_over(&h, upstream_without_tools)
        .process_permissions()
        .await
        .unwrap();

    assert!(h.store.resources().get_by_link("acme/tools").await.unwrap().is_none());
    assert_eq!(count(&h, &PermissionQuery::for_principal(42)).await, 0);
}

#[tokio::test]
async fn recreated_organization_drops_its_old_repositories() {
    let h = harness().await;
    let worker = tracked(&h).await;
    let hubot = h.upstream.user(42, "hubot");
    h.upstream.grant("acme/widgets", &hubot, "read");
    h.upstream.grant("acme/tools", &hubot, "write");
    worker.process_permissions().await.unwrap();

    // `acme` deleted and created again under a new id, keeping `widgets`.
    let recreated = FakeUpstream::default();
    recreated.organization(2, "acme");
    recreated.repository("acme", 10, "widgets");
    let hubot = recreated.user(42, "hubot");
    recreated.grant("acme/widgets", &hubot, "read");
    worker_over(&h, recreated).process_permissions().await.unwrap();

    let resources = h.store.resources();
    assert_eq!(resources.get_by_link("acme").await.unwrap().unwrap().id, 2);
    assert!(resources.get_by_id(1).await.unwrap().is_none());
    assert!(resources.get_by_id(11).await.unwrap().is_none());
    assert!(resources.get_by_link("acme/tools").await.unwrap().is_none());
    let widgets = resources.get_by_id(10).await.unwrap().unwrap();
    assert_eq!(widgets.parent_id, Some(2));
    assert_eq!(widgets.lpath.as_deref(), Some("2.10"));

    assert!(h.store.permissions().get(42, "acme/tools").await.unwrap().is_none());
    let kept = h.store.permissions().get(42, "acme/widgets").await.unwrap().unwrap();
    assert_eq!(kept.parent_link.as_deref(), Some("acme"));
}

#[tokio::test]
async fn nested_tracked_link_stays_below_its_organization() {
    let h = harness().await;
    let worker = tracked(&h).await;
    h.store.links().add("acme/widgets").await.unwrap();
    let hubot = h.upstream.user(42, "hubot");
    h.upstream.grant("acme", &hubot, "admin");
    h.upstream.grant("acme/widgets", &hubot, "read");

    worker.process_permissions().await.unwrap();

    let widgets = h
        .store
        .resources()
        .get_by_link("acme/widgets")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(widgets.parent_id, Some(1));
    assert_eq!(widgets.lpath.as_deref(), Some("1.10"));

    let permission = h.store.permissions().get(42, "acme/widgets").await.unwrap().unwrap();
    assert_eq!(permission.parent_link.as_deref(), Some("acme"));
    assert!(h.store.permissions().get(42, "acme").await.unwrap().unwrap().has_child);

    // Indexing the nested link alone never turns it back into a root.
    h.processor
        .index_link(ghsync_scheduler::Priority::Low, "acme/widgets")
        .await
        .unwrap();
    let widgets = h.store.resources().get_by_id(10).await.unwrap().unwrap();
    assert_eq!(widgets.parent_id, Some(1));
}

#[tokio::test]
async fn run_survives_failed_passes_and_stops_on_shutdown() {
    let h = harness().await;
    seed_acme(&h.upstream);
    h.store.links().add("acme").await.unwrap();
    h.upstream.set_failing(true);
    let worker = Worker::new(
        h.processor.clone(),
        WorkerConfig {
            interval_secs: 3600,
            backoff_secs: 3600,
            ..WorkerConfig::default()
        },
    );

    let (shutdown, signal) = watch::channel(false);
    let handle = tokio::spawn(worker.clone().run(signal));
    while h.upstream.calls().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!handle.is_finished());
    assert_eq!(worker.last_pass(), None);

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn refresh_estimates_follow_the_quota() {
    let h = harness().await;
    let worker = tracked(&h).await;
    let hubot = h.upstream.user(42, "hubot");
    h.upstream.grant("acme", &hubot, "admin");
    h.upstream.grant("acme/widgets", &hubot, "read");
    worker.process_permissions().await.unwrap();

    let per_request = h.lanes.lane(Lane::Service).config().per_request();
    assert_eq!(per_request, Duration::from_millis(720));

    // 3 resources and 2 permissions under `acme`, nothing queued.
    let estimate = worker.estimate_refresh(&["acme".into()]).await.unwrap();
    assert_eq!(estimate, estimate_duration(5, 1.4, per_request));
    assert_eq!(estimate, per_request * 7);

    let widgets = worker
        .estimate_refresh(&["acme/widgets".into()])
        .await
        .unwrap();
    assert_eq!(widgets, estimate_duration(2, 1.4, per_request));

    let full = worker.estimate_full_refresh();
    assert_eq!(Some(full), worker.last_pass());
}
