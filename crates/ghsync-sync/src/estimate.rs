//! How long a refresh is expected to take under the service lane quota.

use std::time::Duration;

use ghsync_core::error::SyncResult;
use ghsync_core::models::resource::normalize_link;
use ghsync_core::repository::{
    PermissionQuery, PermissionRepository, ResourceQuery, ResourceRepository, Store,
};
use ghsync_scheduler::Lane;

use crate::notifier::UnverifiedNotifier;
use crate::upstream::UpstreamClient;
use crate::worker::Worker;

/// `round(requests * factor)` request slots of `per_request` each.
pub fn estimate_duration(requests: u64, factor: f64, per_request: Duration) -> Duration {
    let weighted = (requests as f64 * factor).round();
    let slots = if weighted <= 0.0 {
        0
    } else if weighted >= u32::MAX as f64 {
        u32::MAX
    } else {
        weighted as u32
    };
    per_request.saturating_mul(slots)
}

impl<S, C, N> Worker<S, C, N>
where
    S: Store + 'static,
    C: UpstreamClient,
    N: UnverifiedNotifier,
{
    /// Expected duration of refreshing `links`: one request per resource
    /// and permission below them, plus the jobs already queued.
    pub async fn estimate_refresh(&self, links: &[String]) -> SyncResult<Duration> {
        let store = self.processor.store();
        let mut requests = 0;
        for link in links {
            let link = normalize_link(link);
            requests += store
                .resources()
                .count(&ResourceQuery::under(&link))
                .await?;
            requests += store
                .permissions()
                .count(&PermissionQuery {
                    under_link: Some(link),
                    ..PermissionQuery::default()
                })
                .await?;
        }
        let lanes = self.processor.upstream().lanes();
        requests += lanes.pending() as u64;

        let per_request = lanes.lane(Lane::Service).config().per_request();
        Ok(estimate_duration(
            requests,
            self.config.estimate_factor,
            per_request,
        ))
    }

    /// Expected duration of a full pass: the queued jobs plus the length
    /// of the last pass.
    pub fn estimate_full_refresh(&self) -> Duration {
        let lanes = self.processor.upstream().lanes();
        let per_request = lanes.lane(Lane::Service).config().per_request();
        let queued = u32::try_from(lanes.pending()).unwrap_or(u32::MAX);
        per_request
            .saturating_mul(queued)
            .saturating_add(self.last_pass().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_requests_are_rounded() {
        let per_request = Duration::from_millis(720);
        // 10 * 1.4 = 14 slots
        assert_eq!(
            estimate_duration(10, 1.4, per_request),
            Duration::from_millis(720 * 14)
        );
        // 3 * 1.4 = 4.2, rounded to 4
        assert_eq!(
            estimate_duration(3, 1.4, per_request),
            Duration::from_millis(720 * 4)
        );
        assert_eq!(estimate_duration(0, 1.4, per_request), Duration::ZERO);
    }
}
