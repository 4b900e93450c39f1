//! One-shot and recurring timers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{Clock, DailyTrigger, HostZone, SchedulerError};

/// Boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Work run when a timer fires.
pub type TimerTask = BoxFuture<Result<(), SchedulerError>>;

/// Identifier handed out by [`TimerScheduler::arm_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A timer that has been armed and has not finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub key: String,
    pub at: DateTime<Utc>,
}

struct TimerInner {
    clock: Arc<dyn Clock>,
    pending: DashMap<u64, PendingTimer>,
    /// Live timers per key.
    keys: DashMap<String, usize>,
    next_id: AtomicU64,
    pending_count: watch::Sender<usize>,
    shutdown: watch::Receiver<bool>,
}

impl TimerInner {
    fn release_key(&self, key: &str) {
        if let Some(mut live) = self.keys.get_mut(key) {
            *live = live.saturating_sub(1);
        }
        self.keys.remove_if(key, |_, live| *live == 0);
    }
}

/// Arms callbacks at absolute instants.
///
/// Every timer runs on its own tokio task. Timers cannot be cancelled; a
/// shutdown signal drops the ones that have not fired yet. Failures and
/// panics inside a callback are logged and never reach the caller.
#[derive(Clone)]
pub struct TimerScheduler {
    inner: Arc<TimerInner>,
}

impl TimerScheduler {
    /// Create a scheduler that runs until dropped.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        // The sender is dropped right away, which `wait_for_shutdown` treats as "never".
        let (_, shutdown) = watch::channel(false);
        Self::with_shutdown(clock, shutdown)
    }

    /// Create a scheduler that stops when `shutdown` flips to true.
    pub fn with_shutdown(clock: Arc<dyn Clock>, shutdown: watch::Receiver<bool>) -> Self {
        let (pending_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(TimerInner {
                clock,
                pending: DashMap::new(),
                keys: DashMap::new(),
                next_id: AtomicU64::new(1),
                pending_count,
                shutdown,
            }),
        }
    }

    /// The clock timers are measured against.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Current time on the scheduler's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Run `task` once at or after `at`. Past instants fire immediately.
    ///
    /// `key` names the timer in logs and in [`TimerScheduler::has_pending`].
    pub fn arm_at(&self, key: impl Into<String>, at: DateTime<Utc>, task: TimerTask) -> TimerId {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = (at - self.inner.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        self.inner.pending.insert(
            id,
            PendingTimer {
                key: key.clone(),
                at,
            },
        );
        *self.inner.keys.entry(key.clone()).or_insert(0) += 1;
        self.inner.pending_count.send_modify(|n| *n += 1);
        debug!(timer = id, key = %key, at = %at, delay_secs = delay.as_secs(), "armed timer");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let fired = tokio::select! {
                biased;
                _ = wait_for_shutdown(inner.shutdown.clone()) => false,
                _ = sleep(delay) => true,
            };

            if fired {
                debug!(timer = id, key = %key, "timer fired");
                run_task(id, &key, task).await;
            } else {
                debug!(timer = id, key = %key, "shutdown, dropping timer");
            }

            inner.pending.remove(&id);
            inner.release_key(&key);
            inner.pending_count.send_modify(|n| *n = n.saturating_sub(1));
        });

        TimerId(id)
    }

    /// Run `callback` every time `trigger` fires in `zone`, until shutdown.
    ///
    /// Recurring runs are not counted as pending timers.
    pub fn arm_recurring<F>(&self, trigger: DailyTrigger, zone: HostZone, callback: F) -> JoinHandle<()>
    where
        F: Fn() -> TimerTask + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.inner);
        info!(trigger = %trigger, zone = %zone, "arming recurring trigger");

        tokio::spawn(async move {
            let mut run = 0u64;
            loop {
                let now = inner.clock.now();
                let Some(next) = zone.next_fire(&trigger, now) else {
                    error!(trigger = %trigger, "trigger has no next fire time, stopping");
                    break;
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(trigger = %trigger, next = %next, "waiting for recurring trigger");

                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(inner.shutdown.clone()) => {
                        info!(trigger = %trigger, "recurring trigger shutting down");
                        break;
                    }
                    _ = sleep(delay) => {}
                }

                run += 1;
                info!(trigger = %trigger, run, "recurring trigger fired");
                run_task(0, trigger.expression(), callback()).await;
            }
        })
    }

    /// Number of armed timers that have not finished.
    pub fn pending(&self) -> usize {
        *self.inner.pending_count.borrow()
    }

    /// Whether a timer armed under `key` has not finished.
    pub fn has_pending(&self, key: &str) -> bool {
        self.inner.keys.contains_key(key)
    }

    /// Snapshot of the pending registry, earliest first.
    pub fn pending_timers(&self) -> Vec<PendingTimer> {
        let mut timers: Vec<PendingTimer> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        timers.sort_by_key(|t| t.at);
        timers
    }

    /// Wait until every armed timer, including ones armed while waiting, has finished.
    pub async fn wait_idle(&self) {
        let mut count = self.inner.pending_count.subscribe();
        // The sender lives in `inner`, so this only ends when the count hits zero.
        let _ = count.wait_for(|n| *n == 0).await;
    }
}

/// Run a task on its own tokio task so a panic surfaces as a join error.
async fn run_task(id: u64, key: &str, task: TimerTask) {
    match tokio::spawn(task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(timer = id, key = %key, error = %e, "timer callback failed"),
        Err(e) if e.is_panic() => error!(timer = id, key = %key, "timer callback panicked"),
        Err(e) => warn!(timer = id, key = %key, error = %e, "timer callback cancelled"),
    }
}

/// Resolve once shutdown is requested. A closed channel never resolves.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 8, 0, 0).unwrap()
    }

    fn scheduler() -> (TimerScheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        (TimerScheduler::new(clock.clone()), clock)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_instant() {
        let (timers, clock) = scheduler();
        let fired_at = Arc::new(std::sync::Mutex::new(None));

        let slot = Arc::clone(&fired_at);
        let at = start() + chrono::Duration::hours(4);
        timers.arm_at(
            "u1",
            at,
            Box::pin(async move {
                *slot.lock().unwrap() = Some(clock.now());
                Ok(())
            }),
        );

        assert_eq!(timers.pending(), 1);
        assert!(timers.has_pending("u1"));
        assert!(!timers.has_pending("u2"));

        timers.wait_idle().await;
        assert_eq!(*fired_at.lock().unwrap(), Some(at));
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_stays_pending_until_last_timer_finishes() {
        let (timers, _clock) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        timers.arm_at("u1", start() + chrono::Duration::hours(1), counting(&counter));
        timers.arm_at("u1", start() + chrono::Duration::hours(3), counting(&counter));
        assert!(timers.has_pending("u1"));

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(timers.has_pending("u1"));

        timers.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!timers.has_pending("u1"));
        assert!(timers.inner.keys.is_empty());

        timers.arm_at("u1", start() + chrono::Duration::hours(5), counting(&counter));
        assert!(timers.has_pending("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_instant_fires_immediately() {
        let (timers, _clock) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        let armed = tokio::time::Instant::now();
        timers.arm_at("late", start() - chrono::Duration::hours(3), counting(&counter));
        timers.wait_idle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(armed.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_panicking_callbacks_are_contained() {
        let (timers, _clock) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        timers.arm_at(
            "fails",
            start(),
            Box::pin(async { Err(SchedulerError::InvalidTrigger("boom".into())) }),
        );
        timers.arm_at(
            "panics",
            start(),
            Box::pin(async {
                if start().timestamp() > 0 {
                    panic!("callback panic");
                }
                Ok(())
            }),
        );
        timers.arm_at("ok", start() + chrono::Duration::minutes(1), counting(&counter));

        timers.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_covers_nested_arms() {
        let (timers, _clock) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        let nested = timers.clone();
        let inner_task = counting(&counter);
        timers.arm_at(
            "outer",
            start() + chrono::Duration::hours(1),
            Box::pin(async move {
                nested.arm_at("inner", nested.now() + chrono::Duration::hours(1), inner_task);
                Ok(())
            }),
        );

        timers.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_unfired_timers() {
        let clock = Arc::new(ManualClock::new(start()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timers = TimerScheduler::with_shutdown(clock, shutdown_rx);
        let counter = Arc::new(AtomicUsize::new(0));

        timers.arm_at("later", start() + chrono::Duration::days(30), counting(&counter));
        assert_eq!(timers.pending_timers().len(), 1);

        shutdown_tx.send(true).unwrap();
        timers.wait_idle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(timers.pending_timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_fires_daily_until_shutdown() {
        let clock = Arc::new(ManualClock::new(start()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timers = TimerScheduler::with_shutdown(clock, shutdown_rx);
        let counter = Arc::new(AtomicUsize::new(0));

        let runs = Arc::clone(&counter);
        let handle = timers.arm_recurring(
            DailyTrigger::midnight(),
            HostZone::Named(chrono_tz::Tz::UTC),
            move || counting(&runs),
        );

        // 08:00 -> next midnight is 16 hours away.
        tokio::time::sleep(Duration::from_secs(15 * 3600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(timers.pending(), 0);
    }
}
