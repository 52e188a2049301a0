//! Quota accounting and upstream throttle handling.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

/// Backoff used when the upstream throttles without saying for how long.
const DEFAULT_THROTTLE_BACKOFF: Duration = Duration::from_secs(60);

/// How long the upstream asked callers to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleSignal {
    RetryAfter(Duration),
    ResetAt(DateTime<Utc>),
}

impl ThrottleSignal {
    /// Pause before re-issuing, never longer than `max`. A reset instant
    /// already in the past yields no pause.
    pub fn backoff(&self, now: DateTime<Utc>, max: Duration) -> Duration {
        let wanted = match self {
            Self::RetryAfter(wait) => *wait,
            Self::ResetAt(at) => (*at - now).to_std().unwrap_or(Duration::ZERO),
        };
        wanted.min(max)
    }
}

/// Sliding window of invocation starts.
#[derive(Debug)]
pub struct RateWindow {
    limit: usize,
    span: Duration,
    starts: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(limit: u32, span: Duration) -> Self {
        Self {
            limit: limit.max(1) as usize,
            span,
            starts: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.starts.front() {
            if now.duration_since(*oldest) >= self.span {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until another start fits in the window; `None` if it fits now.
    pub fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        if self.starts.len() < self.limit {
            return None;
        }
        // `oldest + span` may not fit in an `Instant`.
        self.starts
            .front()
            .map(|oldest| self.span.saturating_sub(now.saturating_duration_since(*oldest)))
    }

    pub fn record(&mut self, now: Instant) {
        self.starts.push_back(now);
    }

    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.starts.len()
    }
}

/// Outcome of an upstream HTTP response as far as scheduling cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    NotFound,
    Throttled(ThrottleSignal),
    Failed(u16),
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

/// Classify a response by status and rate-limit headers.
///
/// `429`, and `403` with `x-ratelimit-remaining: 0`, are throttling.
/// `retry-after` (seconds) wins over `x-ratelimit-reset` (epoch seconds).
pub fn classify_response(status: u16, headers: &HashMap<String, String>) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        404 => ResponseClass::NotFound,
        429 => ResponseClass::Throttled(throttle_signal(headers)),
        403 if header(headers, "x-ratelimit-remaining") == Some("0") => {
            ResponseClass::Throttled(throttle_signal(headers))
        }
        other => ResponseClass::Failed(other),
    }
}

fn throttle_signal(headers: &HashMap<String, String>) -> ThrottleSignal {
    if let Some(secs) = header(headers, "retry-after").and_then(|v| v.parse::<u64>().ok()) {
        return ThrottleSignal::RetryAfter(Duration::from_secs(secs));
    }
    header(headers, "x-ratelimit-reset")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .map(ThrottleSignal::ResetAt)
        .unwrap_or(ThrottleSignal::RetryAfter(DEFAULT_THROTTLE_BACKOFF))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn unbounded_window_does_not_overflow() {
        let mut window = RateWindow::new(1, Duration::MAX);
        let start = Instant::now();
        window.record(start);
        assert_eq!(
            window.wait_time(start + Duration::from_secs(1)),
            Some(Duration::MAX - Duration::from_secs(1))
        );
    }

    #[test]
    fn classifies_plain_statuses() {
        let none = HashMap::new();
        assert_eq!(classify_response(200, &none), ResponseClass::Success);
        assert_eq!(classify_response(204, &none), ResponseClass::Success);
        assert_eq!(classify_response(404, &none), ResponseClass::NotFound);
        assert_eq!(classify_response(500, &none), ResponseClass::Failed(500));
        assert_eq!(classify_response(403, &none), ResponseClass::Failed(403));
    }

    #[test]
    fn retry_after_is_seconds() {
        let class = classify_response(429, &headers(&[("Retry-After", "5")]));
        assert_eq!(
            class,
            ResponseClass::Throttled(ThrottleSignal::RetryAfter(Duration::from_secs(5)))
        );
    }

    #[test]
    fn exhausted_quota_403_uses_reset_header() {
        let class = classify_response(
            403,
            &headers(&[
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset", "1700000000"),
            ]),
        );
        let reset = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        assert_eq!(class, ResponseClass::Throttled(ThrottleSignal::ResetAt(reset)));
    }

    #[test]
    fn throttle_without_hints_falls_back() {
        assert_eq!(
            classify_response(429, &HashMap::new()),
            ResponseClass::Throttled(ThrottleSignal::RetryAfter(DEFAULT_THROTTLE_BACKOFF))
        );
    }

    #[test]
    fn backoff_is_clamped_and_never_negative() {
        let now = Utc::now();
        let max = Duration::from_secs(30);

        let long = ThrottleSignal::RetryAfter(Duration::from_secs(600));
        assert_eq!(long.backoff(now, max), max);

        let past = ThrottleSignal::ResetAt(now - chrono::Duration::seconds(10));
        assert_eq!(past.backoff(now, max), Duration::ZERO);

        let soon = ThrottleSignal::ResetAt(now + chrono::Duration::seconds(12));
        assert_eq!(soon.backoff(now, max), Duration::from_secs(12));
    }

    #[test]
    fn rate_window_waits_for_oldest_start() {
        let start = Instant::now();
        let mut window = RateWindow::new(2, Duration::from_secs(10));

        assert_eq!(window.wait_time(start), None);
        window.record(start);
        window.record(start + Duration::from_secs(4));

        let later = start + Duration::from_secs(6);
        assert_eq!(window.wait_time(later), Some(Duration::from_secs(4)));
        assert_eq!(window.wait_time(start + Duration::from_secs(10)), None);
        assert_eq!(window.in_window(start + Duration::from_secs(10)), 1);
    }
}
