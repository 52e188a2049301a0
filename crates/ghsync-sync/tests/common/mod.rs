//! Shared fixtures: an in-memory upstream, a recording notifier and a
//! store over in-memory SurrealDB.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ghsync_core::error::SyncResult;
use ghsync_core::models::permission::UpsertPermission;
use ghsync_core::models::resource::ResourceKind;
use ghsync_core::repository::Store;
use ghsync_db::SurrealStore;
use ghsync_scheduler::{LaneMultiplexer, LanesConfig, ThrottleSignal};
use ghsync_sync::{
    Collaborator, LinkInfo, Processor, ScheduledUpstream, UnverifiedAction, UnverifiedNotifier,
    UnverifiedPayload, UpstreamClient, UpstreamError, UpstreamRepository, UpstreamUser,
    reconcile_permission,
};
use parking_lot::Mutex;
use surrealdb::Surreal;
use surrealdb::engine::local::{Db, Mem};

pub type TestStore = SurrealStore<Db>;
pub type TestProcessor = Processor<TestStore, FakeUpstream, RecordingNotifier>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ghsync=debug")
        .with_test_writer()
        .try_init();
}

pub async fn store() -> TestStore {
    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    ghsync_db::run_migrations(&db).await.unwrap();
    SurrealStore::new(db)
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    links: HashMap<String, LinkInfo>,
    repositories: HashMap<String, Vec<UpstreamRepository>>,
    /// Members per link, with their access level.
    members: HashMap<String, Vec<Collaborator>>,
    users: HashMap<String, UpstreamUser>,
    calls: Vec<String>,
    throttle_next: usize,
    failing: bool,
}

/// Upstream platform kept in memory.
#[derive(Default)]
pub struct FakeUpstream {
    state: Mutex<FakeState>,
}

impl FakeUpstream {
    pub fn organization(&self, id: i64, link: &str) {
        self.state.lock().links.insert(
            link.into(),
            LinkInfo {
                id,
                path: link.into(),
                link: link.into(),
                kind: ResourceKind::Organization,
            },
        );
    }

    pub fn repository(&self, org: &str, id: i64, path: &str) {
        let mut state = self.state.lock();
        let link = format!("{org}/{path}");
        state.links.insert(
            link.clone(),
            LinkInfo {
                id,
                path: path.into(),
                link,
                kind: ResourceKind::Repository,
            },
        );
        state
            .repositories
            .entry(org.into())
            .or_default()
            .push(UpstreamRepository {
                id,
                path: path.into(),
            });
    }

    pub fn user(&self, principal_id: i64, username: &str) -> UpstreamUser {
        let user = UpstreamUser {
            principal_id,
            username: username.into(),
            avatar_url: format!("https://avatars.example/{principal_id}"),
        };
        self.state.lock().users.insert(username.into(), user.clone());
        user
    }

    pub fn grant(&self, link: &str, user: &UpstreamUser, level: &str) {
        let mut state = self.state.lock();
        let members = state.members.entry(link.into()).or_default();
        members.retain(|m| m.username != user.username);
        members.push(Collaborator {
            principal_id: user.principal_id,
            username: user.username.clone(),
            avatar_url: user.avatar_url.clone(),
            access_level: level.into(),
        });
    }

    pub fn revoke(&self, link: &str, username: &str) {
        if let Some(members) = self.state.lock().members.get_mut(link) {
            members.retain(|m| m.username != username);
        }
    }

    pub fn level(&self, link: &str, username: &str) -> Option<String> {
        self.state
            .lock()
            .members
            .get(link)?
            .iter()
            .find(|m| m.username == username)
            .map(|m| m.access_level.clone())
    }

    /// The next `n` calls answer with a one second retry-after.
    pub fn throttle_next(&self, n: usize) {
        self.state.lock().throttle_next = n;
    }

    /// Every call fails with a server error while set.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn enter(&self, call: String) -> Result<(), UpstreamError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing {
            return Err(UpstreamError::Status {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        if state.throttle_next > 0 {
            state.throttle_next -= 1;
            return Err(UpstreamError::Throttled(ThrottleSignal::RetryAfter(
                Duration::from_secs(1),
            )));
        }
        Ok(())
    }
}

impl UpstreamClient for FakeUpstream {
    async fn find_link(&self, link: &str) -> Result<Option<LinkInfo>, UpstreamError> {
        self.enter(format!("find_link {link}"))?;
        Ok(self.state.lock().links.get(link).cloned())
    }

    async fn check_collaborator(
        &self,
        link: &str,
        _kind: ResourceKind,
        username: &str,
    ) -> Result<Option<Collaborator>, UpstreamError> {
        self.enter(format!("check_collaborator {link} {username}"))?;
        Ok(self
            .state
            .lock()
            .members
            .get(link)
            .and_then(|members| members.iter().find(|m| m.username == username).cloned()))
    }

    async fn add_collaborator(
        &self,
        link: &str,
        _kind: ResourceKind,
        username: &str,
        access_level: &str,
    ) -> Result<Option<Collaborator>, UpstreamError> {
        self.enter(format!("add_collaborator {link} {username}"))?;
        let Some(user) = self.state.lock().users.get(username).cloned() else {
            return Ok(None);
        };
        self.grant(link, &user, access_level);
        Ok(Some(Collaborator {
            principal_id: user.principal_id,
            username: user.username,
            avatar_url: user.avatar_url,
            access_level: access_level.into(),
        }))
    }

    async fn update_collaborator(
        &self,
        link: &str,
        kind: ResourceKind,
        username: &str,
        access_level: &str,
    ) -> Result<Option<Collaborator>, UpstreamError> {
        self.add_collaborator(link, kind, username, access_level)
            .await
    }

    async fn remove_collaborator(
        &self,
        link: &str,
        _kind: ResourceKind,
        username: &str,
    ) -> Result<(), UpstreamError> {
        self.enter(format!("remove_collaborator {link} {username}"))?;
        self.revoke(link, username);
        Ok(())
    }

    async fn get_user(&self, username: &str) -> Result<Option<UpstreamUser>, UpstreamError> {
        self.enter(format!("get_user {username}"))?;
        Ok(self.state.lock().users.get(username).cloned())
    }

    async fn list_members(
        &self,
        link: &str,
        kind: ResourceKind,
    ) -> Result<Vec<Collaborator>, UpstreamError> {
        self.enter(format!("list_members {link}"))?;
        let mut members = self
            .state
            .lock()
            .members
            .get(link)
            .cloned()
            .unwrap_or_default();
        // Organization listings carry no roles.
        if kind == ResourceKind::Organization {
            for member in &mut members {
                member.access_level.clear();
            }
        }
        Ok(members)
    }

    async fn list_repositories(
        &self,
        org_link: &str,
    ) -> Result<Vec<UpstreamRepository>, UpstreamError> {
        self.enter(format!("list_repositories {org_link}"))?;
        Ok(self
            .state
            .lock()
            .repositories
            .get(org_link)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<UnverifiedPayload>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<UnverifiedPayload> {
        self.sent.lock().clone()
    }

    /// Usernames sent with `action`, in order.
    pub fn usernames(&self, action: UnverifiedAction) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|p| p.action == action)
            .flat_map(|p| p.users.iter().filter_map(|u| u.username.clone()))
            .collect()
    }
}

impl UnverifiedNotifier for RecordingNotifier {
    async fn publish(&self, _request_id: &str, payload: UnverifiedPayload) -> SyncResult<()> {
        self.sent.lock().push(payload);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<TestStore>,
    pub upstream: Arc<FakeUpstream>,
    pub notifier: Arc<RecordingNotifier>,
    pub lanes: LaneMultiplexer,
    pub processor: TestProcessor,
}

pub async fn harness() -> Harness {
    init_tracing();
    let store = Arc::new(store().await);
    let upstream = Arc::new(FakeUpstream::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let lanes = LaneMultiplexer::start(&LanesConfig::default());
    let processor = Processor::new(
        store.clone(),
        ScheduledUpstream::new(upstream.clone(), lanes.clone()),
        notifier.clone(),
    );
    Harness {
        store,
        upstream,
        notifier,
        lanes,
        processor,
    }
}

/// Upstream org `acme` (id 1) with repositories `widgets` (10) and
/// `tools` (11).
pub fn seed_acme(upstream: &FakeUpstream) {
    upstream.organization(1, "acme");
    upstream.repository("acme", 10, "widgets");
    upstream.repository("acme", 11, "tools");
}

/// Upsert a permission and reconcile it in one transaction.
pub async fn grant(
    store: &TestStore,
    principal_id: i64,
    link: &str,
    kind: ResourceKind,
    level: &str,
) {
    let mut tx = store.begin();
    let existing = tx.permission(principal_id, link).await.unwrap();
    tx.put_permission(
        UpsertPermission {
            principal_id,
            user_id: None,
            username: format!("user{principal_id}"),
            resource_link: link.into(),
            resource_kind: kind,
            access_level: level.into(),
            avatar_url: String::new(),
            expires_at: None,
        }
        .apply(existing, chrono::Utc::now()),
    );
    reconcile_permission(&mut tx, principal_id, link)
        .await
        .unwrap();
    tx.commit().await.unwrap();
}
