//! Integration tests for the priority scheduler, run on a paused tokio
//! clock so quota windows and backoffs elapse instantly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ghsync_scheduler::{
    Lane, LaneMultiplexer, LanesConfig, Priority, Scheduler, SchedulerConfig, SchedulerError,
    ThrottleAware, ThrottleSignal,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, PartialEq, thiserror::Error)]
enum CallError {
    #[error("throttled for {0:?}")]
    Throttled(Duration),
    #[error("business failure: {0}")]
    Business(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl ThrottleAware for CallError {
    fn throttle_signal(&self) -> Option<ThrottleSignal> {
        match self {
            Self::Throttled(wait) => Some(ThrottleSignal::RetryAfter(*wait)),
            _ => None,
        }
    }
}

fn config(requests_amount: u32, time_limit_secs: u64) -> SchedulerConfig {
    SchedulerConfig {
        lane: "test".into(),
        requests_amount,
        time_limit_secs,
        call_timeout_secs: 3600,
        max_backoff_secs: 3600,
    }
}

/// Occupy the lane until the returned sender fires.
async fn block_lane(scheduler: &Scheduler) -> oneshot::Sender<()> {
    let (release, gate) = oneshot::channel::<()>();
    let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));
    let (started_tx, started) = oneshot::channel();
    let started_tx = Arc::new(Mutex::new(Some(started_tx)));

    let lane = scheduler.clone();
    tokio::spawn(async move {
        lane.submit(Priority::High, move || {
            let gate = gate.clone();
            let started_tx = started_tx.clone();
            async move {
                if let Some(tx) = started_tx.lock().take() {
                    let _ = tx.send(());
                }
                if let Some(gate) = gate.lock().await.take() {
                    let _ = gate.await;
                }
                Ok::<_, CallError>(())
            }
        })
        .await
    });

    started.await.unwrap();
    release
}

async fn wait_for_pending(scheduler: &Scheduler, expected: usize) {
    while scheduler.pending() != expected {
        tokio::task::yield_now().await;
    }
}

fn recording_job(
    log: &Arc<Mutex<Vec<&'static str>>>,
    name: &'static str,
) -> impl FnMut() -> std::future::Ready<Result<&'static str, CallError>> + Send + 'static {
    let log = log.clone();
    move || {
        log.lock().push(name);
        std::future::ready(Ok(name))
    }
}

#[tokio::test(start_paused = true)]
async fn higher_priority_runs_first() {
    let scheduler = Scheduler::start(config(100, 60));
    let log = Arc::new(Mutex::new(Vec::new()));
    let release = block_lane(&scheduler).await;

    let mut handles = Vec::new();
    for (priority, name) in [
        (Priority::Low, "low"),
        (Priority::Normal, "normal"),
        (Priority::High, "high"),
    ] {
        let lane = scheduler.clone();
        let job = recording_job(&log, name);
        handles.push(tokio::spawn(async move { lane.submit(priority, job).await }));
    }
    wait_for_pending(&scheduler, 3).await;

    release.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(*log.lock(), vec!["high", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn equal_priority_is_fifo() {
    let scheduler = Scheduler::start(config(100, 60));
    let log = Arc::new(Mutex::new(Vec::new()));
    let release = block_lane(&scheduler).await;

    let mut handles = Vec::new();
    for (expected, name) in ["first", "second", "third"].into_iter().enumerate() {
        let lane = scheduler.clone();
        let job = recording_job(&log, name);
        handles.push(tokio::spawn(async move { lane.submit(Priority::Normal, job).await }));
        wait_for_pending(&scheduler, expected + 1).await;
    }

    release.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(*log.lock(), vec!["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn quota_limits_starts_per_window() {
    let scheduler = Scheduler::start(config(2, 10));
    let starts = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let lane = scheduler.clone();
        let starts = starts.clone();
        handles.push(tokio::spawn(async move {
            lane.submit(Priority::Normal, move || {
                starts.lock().push(Instant::now());
                std::future::ready(Ok::<_, CallError>(()))
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let starts = starts.lock();
    assert_eq!(starts.len(), 3);
    assert!(starts[1] - starts[0] < Duration::from_secs(10));
    assert!(starts[2] - starts[0] >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn retry_after_is_honoured_transparently() {
    let scheduler = Scheduler::start(config(100, 60));
    let attempts = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let counter = attempts.clone();
    let result = scheduler
        .submit(Priority::Normal, move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if attempt == 0 {
                Err(CallError::Throttled(Duration::from_secs(5)))
            } else {
                Ok("payload")
            })
        })
        .await;

    assert_eq!(result, Ok("payload"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn backoff_is_clamped_to_max() {
    let scheduler = Scheduler::start(SchedulerConfig {
        max_backoff_secs: 2,
        ..config(100, 60)
    });
    let attempts = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let counter = attempts.clone();
    scheduler
        .submit(Priority::Normal, move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if attempt == 0 {
                Err(CallError::Throttled(Duration::from_secs(600)))
            } else {
                Ok(())
            })
        })
        .await
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(600));
}

#[tokio::test(start_paused = true)]
async fn business_errors_are_not_retried() {
    let scheduler = Scheduler::start(config(100, 60));
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let result: Result<(), _> = scheduler
        .submit(Priority::High, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(CallError::Business("422 validation failed".into())))
        })
        .await;

    assert_eq!(result, Err(CallError::Business("422 validation failed".into())));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_calls_time_out_without_retry() {
    let scheduler = Scheduler::start(SchedulerConfig {
        call_timeout_secs: 1,
        ..config(100, 60)
    });
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let result: Result<(), _> = scheduler
        .submit(Priority::Normal, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, CallError>(())
            }
        })
        .await;

    assert_eq!(
        result,
        Err(CallError::Scheduler(SchedulerError::Timeout(Duration::from_secs(1))))
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_and_later_submissions() {
    let scheduler = Scheduler::start(config(100, 60));
    let log = Arc::new(Mutex::new(Vec::new()));
    let release = block_lane(&scheduler).await;

    let lane = scheduler.clone();
    let job = recording_job(&log, "pending");
    let pending = tokio::spawn(async move { lane.submit(Priority::Low, job).await });
    wait_for_pending(&scheduler, 1).await;

    scheduler.shutdown();
    assert!(scheduler.is_shutdown());
    assert_eq!(
        pending.await.unwrap(),
        Err(CallError::Scheduler(SchedulerError::Cancelled))
    );

    let late = scheduler
        .submit(Priority::High, recording_job(&log, "late"))
        .await;
    assert_eq!(late, Err(CallError::Scheduler(SchedulerError::Cancelled)));

    let _ = release.send(());
    assert!(log.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_job_sleeping_on_backoff() {
    let scheduler = Scheduler::start(config(100, 60));
    let attempts = Arc::new(AtomicUsize::new(0));

    let lane = scheduler.clone();
    let counter = attempts.clone();
    let waiting = tokio::spawn(async move {
        lane.submit(Priority::Normal, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<(), _>(CallError::Throttled(Duration::from_secs(100))))
        })
        .await
    });

    while attempts.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    scheduler.shutdown();

    assert_eq!(
        waiting.await.unwrap(),
        Err(CallError::Scheduler(SchedulerError::Cancelled))
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_jobs_are_skipped() {
    let scheduler = Scheduler::start(config(100, 60));
    let log = Arc::new(Mutex::new(Vec::new()));
    let release = block_lane(&scheduler).await;

    let lane = scheduler.clone();
    let job = recording_job(&log, "abandoned");
    let abandoned = tokio::spawn(async move { lane.submit(Priority::High, job).await });
    wait_for_pending(&scheduler, 1).await;
    abandoned.abort();
    wait_for_pending(&scheduler, 0).await;

    release.send(()).unwrap();
    let kept = scheduler
        .submit(Priority::Low, recording_job(&log, "kept"))
        .await;

    assert_eq!(kept, Ok("kept"));
    assert_eq!(*log.lock(), vec!["kept"]);
}

#[tokio::test(start_paused = true)]
async fn lanes_drain_independently() {
    let lanes = LaneMultiplexer::start(&LanesConfig {
        service: config(100, 60),
        user: config(100, 60),
    });
    let release = block_lane(lanes.lane(Lane::Service)).await;

    let profile = lanes
        .submit(Lane::User, Priority::Normal, || {
            std::future::ready(Ok::<_, CallError>("octocat"))
        })
        .await;
    assert_eq!(profile, Ok("octocat"));

    let log = Arc::new(Mutex::new(Vec::new()));
    let service = lanes.clone();
    let job = recording_job(&log, "listing");
    let listing =
        tokio::spawn(async move { service.submit(Lane::Service, Priority::Low, job).await });
    wait_for_pending(lanes.lane(Lane::Service), 1).await;
    assert_eq!(lanes.pending(), 1);

    release.send(()).unwrap();
    assert_eq!(listing.await.unwrap(), Ok("listing"));
    lanes.shutdown();
}
