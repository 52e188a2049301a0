use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, ThrottleAware};
use crate::governor::{RateWindow, ThrottleSignal};
use crate::job::{JobId, JobState, Priority};
use crate::queue::JobQueue;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

enum Attempt {
    Done,
    Throttled(ThrottleSignal),
}

/// A job with its result type erased. Dropping it without a completed
/// attempt cancels the waiting caller.
trait Work: Send {
    fn attempt(&mut self, timeout: Duration) -> BoxFuture<'_, Attempt>;
}

struct Thunk<F, Fut, T, E> {
    call: F,
    reply: Option<oneshot::Sender<Result<T, E>>>,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut, T, E> Work for Thunk<F, Fut, T, E>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: ThrottleAware + From<SchedulerError> + Send,
{
    fn attempt(&mut self, timeout: Duration) -> BoxFuture<'_, Attempt> {
        Box::pin(async move {
            let result = match tokio::time::timeout(timeout, (self.call)()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => match err.throttle_signal() {
                    Some(signal) => return Attempt::Throttled(signal),
                    None => Err(err),
                },
                Err(_) => Err(E::from(SchedulerError::Timeout(timeout))),
            };
            if let Some(reply) = self.reply.take() {
                // The caller may have gone away; nothing to deliver then.
                let _ = reply.send(result);
            }
            Attempt::Done
        })
    }
}

struct Inner {
    config: SchedulerConfig,
    queue: Mutex<JobQueue<Box<dyn Work>>>,
    wakeup: Notify,
}

/// Removes the submitter's queue entry however `submit` ends.
struct Reclaim<'a> {
    inner: &'a Inner,
    id: JobId,
}

impl Drop for Reclaim<'_> {
    fn drop(&mut self) {
        if let Some(JobState::Pending) = self.inner.queue.lock().reclaim(self.id) {
            debug!(lane = %self.inner.config.lane, job_id = %self.id, "Pending job abandoned by caller");
        }
    }
}

/// One rate-limited lane: a priority heap drained by a single background
/// task. The task stops on `shutdown` or once every handle is dropped.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    // Not shared with the drain task, whose receiver sees it close.
    shutdown: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    /// Spawn the drain loop on the current tokio runtime.
    pub fn start(config: SchedulerConfig) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            queue: Mutex::new(JobQueue::new()),
            wakeup: Notify::new(),
        });
        info!(
            lane = %inner.config.lane,
            requests_amount = inner.config.requests_amount,
            time_limit_secs = inner.config.time_limit_secs,
            "Starting scheduler lane"
        );
        tokio::spawn(drive(inner.clone(), signal));
        Self {
            inner,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Run `call` on this lane and wait for its result.
    ///
    /// `call` is invoked again after a throttle backoff, so it must build
    /// a fresh request on every invocation.
    pub async fn submit<T, E, F, Fut>(&self, priority: Priority, call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: ThrottleAware + From<SchedulerError> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let work: Box<dyn Work> = Box::new(Thunk {
            call,
            reply: Some(reply),
            _future: PhantomData,
        });

        let id = self.inner.queue.lock().push(priority, work)?;
        let _reclaim = Reclaim {
            inner: &self.inner,
            id,
        };
        self.inner.wakeup.notify_one();
        debug!(lane = %self.inner.config.lane, job_id = %id, ?priority, "Job submitted");

        match result.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SchedulerError::Cancelled.into()),
        }
    }

    /// Jobs waiting to start.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().pending()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.queue.lock().is_closed()
    }

    /// Stop the lane. Waiting jobs and jobs sleeping on a throttle backoff
    /// are cancelled; a job already executing finishes first.
    pub fn shutdown(&self) {
        let dropped = self.inner.queue.lock().close();
        info!(
            lane = %self.inner.config.lane,
            cancelled = dropped.len(),
            "Shutting down scheduler lane"
        );
        drop(dropped);
        self.shutdown.send_replace(true);
        self.inner.wakeup.notify_one();
    }
}

/// Shutdown was requested, or every handle is gone.
fn stopped(signal: &watch::Receiver<bool>) -> bool {
    *signal.borrow() || signal.has_changed().is_err()
}

/// Sleep for `pause` unless shutdown is signalled first. Returns `false`
/// on shutdown.
async fn pause_or_shutdown(pause: Duration, signal: &mut watch::Receiver<bool>) -> bool {
    if stopped(signal) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(pause) => true,
        _ = signal.changed() => false,
    }
}

async fn drive(inner: Arc<Inner>, mut signal: watch::Receiver<bool>) {
    let config = &inner.config;
    let mut window = RateWindow::new(config.requests_amount, config.time_limit());

    'drain: loop {
        if stopped(&signal) {
            break;
        }

        if let Some(wait) = window.wait_time(Instant::now()) {
            debug!(lane = %config.lane, wait_ms = wait.as_millis() as u64, "Quota exhausted");
            if !pause_or_shutdown(wait, &mut signal).await {
                break;
            }
            continue;
        }

        let next = inner.queue.lock().pop();
        let Some((id, mut work)) = next else {
            tokio::select! {
                _ = inner.wakeup.notified() => {}
                changed = signal.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        loop {
            window.record(Instant::now());
            match work.attempt(config.call_timeout()).await {
                Attempt::Done => break,
                Attempt::Throttled(throttle) => {
                    let pause = throttle.backoff(Utc::now(), config.max_backoff());
                    warn!(
                        lane = %config.lane,
                        job_id = %id,
                        backoff_ms = pause.as_millis() as u64,
                        "Upstream throttled request, backing off"
                    );
                    if !pause_or_shutdown(pause, &mut signal).await {
                        break 'drain;
                    }
                    if let Some(wait) = window.wait_time(Instant::now()) {
                        if !pause_or_shutdown(wait, &mut signal).await {
                            break 'drain;
                        }
                    }
                }
            }
        }

        inner.queue.lock().complete(id);
    }

    let cancelled = inner.queue.lock().close();
    info!(lane = %config.lane, cancelled = cancelled.len(), "Scheduler lane stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lane_stops_once_every_handle_is_gone() {
        let scheduler = Scheduler::start(SchedulerConfig::named("test"));
        let spare = scheduler.clone();
        let inner = Arc::downgrade(&scheduler.inner);

        drop(scheduler);
        tokio::task::yield_now().await;
        assert!(inner.upgrade().is_some());
        assert!(!spare.is_shutdown());

        drop(spare);
        tokio::time::timeout(Duration::from_secs(5), async {
            while inner.upgrade().is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("drain task outlived its handles");
    }
}
