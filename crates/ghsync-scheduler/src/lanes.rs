use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::LanesConfig;
use crate::error::{SchedulerError, ThrottleAware};
use crate::job::Priority;
use crate::scheduler::Scheduler;

/// Upstream credential class a call is issued with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Elevated credential: bulk listing, collaborator changes, link type
    /// resolution.
    Service,
    /// Restricted credential: principal profile lookups.
    User,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Service, Lane::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent schedulers per lane: separate heaps, loops and quotas.
#[derive(Clone)]
pub struct LaneMultiplexer {
    service: Scheduler,
    user: Scheduler,
}

impl LaneMultiplexer {
    pub fn start(config: &LanesConfig) -> Self {
        let mut service = config.service.clone();
        service.lane = Lane::Service.as_str().into();
        let mut user = config.user.clone();
        user.lane = Lane::User.as_str().into();
        Self {
            service: Scheduler::start(service),
            user: Scheduler::start(user),
        }
    }

    pub fn lane(&self, lane: Lane) -> &Scheduler {
        match lane {
            Lane::Service => &self.service,
            Lane::User => &self.user,
        }
    }

    pub async fn submit<T, E, F, Fut>(&self, lane: Lane, priority: Priority, call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: ThrottleAware + From<SchedulerError> + Send + 'static,
    {
        self.lane(lane).submit(priority, call).await
    }

    /// Jobs waiting to start across every lane.
    pub fn pending(&self) -> usize {
        Lane::ALL.iter().map(|lane| self.lane(*lane).pending()).sum()
    }

    pub fn shutdown(&self) {
        for lane in Lane::ALL {
            self.lane(lane).shutdown();
        }
    }
}
