//! The upstream platform seam and its lane-scheduled wrapper.
//!
//! [`UpstreamClient`] is implemented by the HTTP client of the hosting
//! platform. Nothing in this crate calls it directly: every call goes
//! through [`ScheduledUpstream`], which routes it to the right lane at the
//! caller's priority so quotas and throttling are honoured.

use std::sync::Arc;

use ghsync_core::models::resource::ResourceKind;
use ghsync_scheduler::{Lane, LaneMultiplexer, Priority};
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;

/// A link resolved upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub id: i64,
    pub path: String,
    pub link: String,
    pub kind: ResourceKind,
}

/// A principal's access at one resource, as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub principal_id: i64,
    pub username: String,
    pub avatar_url: String,
    /// Empty when the listing does not report roles (organization
    /// members); resolve it with a membership check.
    pub access_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamUser {
    pub principal_id: i64,
    pub username: String,
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRepository {
    pub id: i64,
    pub path: String,
}

/// Calls against the hosting platform. "Not found" answers are `None`,
/// never an error.
pub trait UpstreamClient: Send + Sync + 'static {
    fn find_link(
        &self,
        link: &str,
    ) -> impl Future<Output = Result<Option<LinkInfo>, UpstreamError>> + Send;

    /// The principal's access at `link`; for organizations this is the
    /// membership role.
    fn check_collaborator(
        &self,
        link: &str,
        kind: ResourceKind,
        username: &str,
    ) -> impl Future<Output = Result<Option<Collaborator>, UpstreamError>> + Send;

    fn add_collaborator(
        &self,
        link: &str,
        kind: ResourceKind,
        username: &str,
        access_level: &str,
    ) -> impl Future<Output = Result<Option<Collaborator>, UpstreamError>> + Send;

    fn update_collaborator(
        &self,
        link: &str,
        kind: ResourceKind,
        username: &str,
        access_level: &str,
    ) -> impl Future<Output = Result<Option<Collaborator>, UpstreamError>> + Send;

    fn remove_collaborator(
        &self,
        link: &str,
        kind: ResourceKind,
        username: &str,
    ) -> impl Future<Output = Result<(), UpstreamError>> + Send;

    fn get_user(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Option<UpstreamUser>, UpstreamError>> + Send;

    fn list_members(
        &self,
        link: &str,
        kind: ResourceKind,
    ) -> impl Future<Output = Result<Vec<Collaborator>, UpstreamError>> + Send;

    fn list_repositories(
        &self,
        org_link: &str,
    ) -> impl Future<Output = Result<Vec<UpstreamRepository>, UpstreamError>> + Send;
}

/// An [`UpstreamClient`] whose calls are queued on the lanes.
///
/// Profile lookups use the user lane; everything else uses the service
/// lane.
pub struct ScheduledUpstream<C> {
    client: Arc<C>,
    lanes: LaneMultiplexer,
}

impl<C> Clone for ScheduledUpstream<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            lanes: self.lanes.clone(),
        }
    }
}

impl<C: UpstreamClient> ScheduledUpstream<C> {
    pub fn new(client: Arc<C>, lanes: LaneMultiplexer) -> Self {
        Self { client, lanes }
    }

    pub fn lanes(&self) -> &LaneMultiplexer {
        &self.lanes
    }

    pub async fn find_link(
        &self,
        priority: Priority,
        link: &str,
    ) -> Result<Option<LinkInfo>, UpstreamError> {
        let client = self.client.clone();
        let link = link.to_string();
        self.lanes
            .submit(Lane::Service, priority, move || {
                let client = client.clone();
                let link = link.clone();
                async move { client.find_link(&link).await }
            })
            .await
    }

    pub async fn check_collaborator(
        &self,
        priority: Priority,
        link: &str,
        kind: ResourceKind,
        username: &str,
    ) -> Result<Option<Collaborator>, UpstreamError> {
        let client = self.client.clone();
        let (link, username) = (link.to_string(), username.to_string());
        self.lanes
            .submit(Lane::Service, priority, move || {
                let client = client.clone();
                let (link, username) = (link.clone(), username.clone());
                async move { client.check_collaborator(&link, kind, &username).await }
            })
            .await
    }

    pub async fn add_collaborator(
        &self,
        priority: Priority,
        link: &str,
        kind: ResourceKind,
        username: &str,
        access_level: &str,
    ) -> Result<Option<Collaborator>, UpstreamError> {
        let client = self.client.clone();
        let (link, username, level) = (
            link.to_string(),
            username.to_string(),
            access_level.to_string(),
        );
        self.lanes
            .submit(Lane::Service, priority, move || {
                let client = client.clone();
                let (link, username, level) = (link.clone(), username.clone(), level.clone());
                async move {
                    client
                        .add_collaborator(&link, kind, &username, &level)
                        .await
                }
            })
            .await
    }

    pub async fn update_collaborator(
        &self,
        priority: Priority,
        link: &str,
        kind: ResourceKind,
        username: &str,
        access_level: &str,
    ) -> Result<Option<Collaborator>, UpstreamError> {
        let client = self.client.clone();
        let (link, username, level) = (
            link.to_string(),
            username.to_string(),
            access_level.to_string(),
        );
        self.lanes
            .submit(Lane::Service, priority, move || {
                let client = client.clone();
                let (link, username, level) = (link.clone(), username.clone(), level.clone());
                async move {
                    client
                        .update_collaborator(&link, kind, &username, &level)
                        .await
                }
            })
            .await
    }

    pub async fn remove_collaborator(
        &self,
        priority: Priority,
        link: &str,
        kind: ResourceKind,
        username: &str,
    ) -> Result<(), UpstreamError> {
        let client = self.client.clone();
        let (link, username) = (link.to_string(), username.to_string());
        self.lanes
            .submit(Lane::Service, priority, move || {
                let client = client.clone();
                let (link, username) = (link.clone(), username.clone());
                async move { client.remove_collaborator(&link, kind, &username).await }
            })
            .await
    }

    pub async fn get_user(
        &self,
        priority: Priority,
        username: &str,
    ) -> Result<Option<UpstreamUser>, UpstreamError> {
        let client = self.client.clone();
        let username = username.to_string();
        self.lanes
            .submit(Lane::User, priority, move || {
                let client = client.clone();
                let username = username.clone();
                async move { client.get_user(&username).await }
            })
            .await
    }

    pub async fn list_members(
        &self,
        priority: Priority,
        link: &str,
        kind: ResourceKind,
    ) -> Result<Vec<Collaborator>, UpstreamError> {
        let client = self.client.clone();
        let link = link.to_string();
        self.lanes
            .submit(Lane::Service, priority, move || {
                let client = client.clone();
                let link = link.clone();
                async move { client.list_members(&link, kind).await }
            })
            .await
    }

    pub async fn list_repositories(
        &self,
        priority: Priority,
        org_link: &str,
    ) -> Result<Vec<UpstreamRepository>, UpstreamError> {
        let client = self.client.clone();
        let link = org_link.to_string();
        self.lanes
            .submit(Lane::Service, priority, move || {
                let client = client.clone();
                let link = link.clone();
                async move { client.list_repositories(&link).await }
            })
            .await
    }
}
