//! Per-user send and retry state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use cake_directory::{DirectoryGateway, UserPatch, UserRecord};

use crate::calendar::{local_year, parse_timezone, sent_this_year};
use crate::timer::BoxFuture;
use crate::{
    DeliveryExecutor, DeliveryOutcome, DeliveryState, SchedulerConfig, SchedulerError, TimerId,
    TimerScheduler,
};

/// Drives one user from a due send to success or exhaustion.
///
/// Each retry is armed only after the previous outcome is persisted, so a
/// user's attempts never overlap. The record carried between attempts is the
/// one returned by the last directory update. Timers armed earlier may still
/// hold older copies, so settled years are also tracked in process.
#[derive(Clone)]
pub struct RetryMachine {
    directory: Arc<dyn DirectoryGateway>,
    executor: DeliveryExecutor,
    timers: TimerScheduler,
    /// User id to the local year of the last delivery or exhaustion.
    settled: Arc<DashMap<String, i32>>,
    max_retry_count: u32,
    retry_delay: chrono::Duration,
}

impl RetryMachine {
    pub fn new(
        directory: Arc<dyn DirectoryGateway>,
        executor: DeliveryExecutor,
        timers: TimerScheduler,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            directory,
            executor,
            timers,
            settled: Arc::new(DashMap::new()),
            max_retry_count: config.max_retry_count,
            retry_delay: config.retry_delay(),
        }
    }

    /// Arm the user's send at `at`.
    pub fn schedule(&self, user: UserRecord, at: DateTime<Utc>) -> TimerId {
        transition(&user.id, DeliveryState::Idle, DeliveryState::Scheduled);
        let machine = self.clone();
        let key = user.id.clone();
        self.timers.arm_at(
            key,
            at,
            Box::pin(async move { machine.fire(user).await.map(|_| ()) }),
        )
    }

    /// Run a fired send: skip if already sent this year, else attempt it.
    pub fn fire(&self, user: UserRecord) -> BoxFuture<Result<DeliveryOutcome, SchedulerError>> {
        let machine = self.clone();
        Box::pin(async move {
            let now = machine.timers.now();
            if sent_this_year(&user, now) || machine.settled_this_year(&user, now) {
                debug!(user_id = %user.id, "already sent this year, skipping");
                return Ok(DeliveryOutcome::AlreadySent);
            }

            transition(&user.id, DeliveryState::Scheduled, DeliveryState::Attempting);
            if machine.executor.attempt(&user).await {
                let at = machine.timers.now();
                machine
                    .directory
                    .update(&user.id, &UserPatch::delivered(at))
                    .await?;
                machine.settle(&user, at);
                transition(&user.id, DeliveryState::Attempting, DeliveryState::Success);
                info!(user_id = %user.id, "birthday email delivered");
                return Ok(DeliveryOutcome::Delivered { at });
            }

            machine.handle_retry(user).await
        })
    }

    /// Pick up a user left unsent by an earlier run.
    ///
    /// A user already at the cap still gets the final attempt before the
    /// year is abandoned.
    pub async fn resume(&self, user: UserRecord) -> Result<DeliveryOutcome, SchedulerError> {
        if user.retry_count >= self.max_retry_count {
            return self.fire(user).await;
        }
        self.handle_retry(user).await
    }

    /// Decide what follows a failed attempt.
    ///
    /// Below the cap the retry count is bumped and another attempt armed one
    /// interval out. At the cap the count resets and the year is abandoned.
    pub async fn handle_retry(&self, user: UserRecord) -> Result<DeliveryOutcome, SchedulerError> {
        let now = self.timers.now();

        if user.retry_count < self.max_retry_count {
            let retry_count = user.retry_count + 1;
            let updated = self
                .directory
                .update(&user.id, &UserPatch::retrying(retry_count))
                .await?;

            let at = now + self.retry_delay;
            transition(&user.id, DeliveryState::Attempting, DeliveryState::Scheduled);
            warn!(
                user_id = %user.id,
                retry_count,
                max_retry_count = self.max_retry_count,
                at = %at,
                "delivery failed, retry scheduled"
            );

            let machine = self.clone();
            self.timers.arm_at(
                user.id.clone(),
                at,
                Box::pin(async move { machine.fire(updated).await.map(|_| ()) }),
            );
            return Ok(DeliveryOutcome::RetryScheduled { retry_count, at });
        }

        self.directory
            .update(&user.id, &UserPatch::exhausted(&user, now))
            .await?;
        self.settle(&user, now);
        transition(&user.id, DeliveryState::Attempting, DeliveryState::Exhausted);
        warn!(
            user_id = %user.id,
            attempts = self.max_retry_count + 1,
            "retry budget exhausted, giving up for this year"
        );
        Ok(DeliveryOutcome::Exhausted)
    }

    fn settle(&self, user: &UserRecord, at: DateTime<Utc>) {
        self.settled.insert(user.id.clone(), settle_year(user, at));
    }

    fn settled_this_year(&self, user: &UserRecord, now: DateTime<Utc>) -> bool {
        self.settled
            .get(&user.id)
            .is_some_and(|year| *year == settle_year(user, now))
    }
}

/// Local year of `at` for the user, or the UTC year when the zone is invalid.
fn settle_year(user: &UserRecord, at: DateTime<Utc>) -> i32 {
    let tz = parse_timezone(&user.location).unwrap_or(chrono_tz::Tz::UTC);
    local_year(&tz, at)
}

fn transition(user_id: &str, from: DeliveryState, to: DeliveryState) {
    debug!(user_id, from = %from, to = %to, terminal = to.is_terminal(), "delivery state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cake_directory::InMemoryDirectory;
    use cake_mailer::EmailTransport;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::ManualClock;

    struct Scripted {
        results: std::sync::Mutex<Vec<bool>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        /// Answers in order; once exhausted, keeps failing.
        fn new(results: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                results: std::sync::Mutex::new(results.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EmailTransport for Scripted {
        async fn send(&self, _display_name: &str, _email: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop().unwrap_or(false)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap()
    }

    fn user(retry_count: u32) -> UserRecord {
        UserRecord {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            date_of_birth: "1906-06-15".to_string(),
            location: "UTC".to_string(),
            last_email_sent: None,
            retry_count,
            created_at: None,
        }
    }

    fn machine(
        transport: Arc<Scripted>,
        directory: Arc<InMemoryDirectory>,
        max_retry_count: u32,
    ) -> (RetryMachine, TimerScheduler) {
        let timers = TimerScheduler::new(Arc::new(ManualClock::new(now())));
        let config = SchedulerConfig {
            max_retry_count,
            ..Default::default()
        };
        let executor = DeliveryExecutor::new(transport, Duration::from_secs(30));
        (
            RetryMachine::new(directory, executor, timers.clone(), &config),
            timers,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_persists_and_resets() {
        let directory = Arc::new(InMemoryDirectory::new(vec![user(2)]));
        let transport = Scripted::new(vec![true]);
        let (machine, _) = machine(transport.clone(), directory.clone(), 3);

        let outcome = machine.fire(user(2)).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { at: now() });

        let stored = directory.get("u1").await.unwrap();
        assert_eq!(stored.last_email_sent, Some(now()));
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_sent_is_untouched() {
        let mut sent = user(1);
        sent.last_email_sent = Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        let directory = Arc::new(InMemoryDirectory::new(vec![sent.clone()]));
        let transport = Scripted::new(vec![true]);
        let (machine, timers) = machine(transport.clone(), directory.clone(), 3);

        let outcome = machine.fire(sent.clone()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::AlreadySent);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(directory.get("u1").await.unwrap(), sent);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_increments_from_zero() {
        let directory = Arc::new(InMemoryDirectory::new(vec![user(0)]));
        let transport = Scripted::new(vec![false]);
        let (machine, timers) = machine(transport, directory.clone(), 3);

        let outcome = machine.fire(user(0)).await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::RetryScheduled {
                retry_count: 1,
                at: now() + chrono::Duration::hours(1)
            }
        );

        let stored = directory.get("u1").await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_email_sent, None);
        assert!(timers.has_pending("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let directory = Arc::new(InMemoryDirectory::new(vec![user(0)]));
        let transport = Scripted::new(vec![false, false, true]);
        let (machine, timers) = machine(transport.clone(), directory.clone(), 3);

        machine.schedule(user(0), now());
        timers.wait_idle().await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        let stored = directory.get("u1").await.unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.last_email_sent, Some(now() + chrono::Duration::hours(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_exhausts_immediately() {
        let directory = Arc::new(InMemoryDirectory::new(vec![user(0)]));
        let transport = Scripted::new(vec![false]);
        let (machine, timers) = machine(transport.clone(), directory.clone(), 0);

        let outcome = machine.fire(user(0)).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Exhausted);
        assert_eq!(timers.pending(), 0);

        let stored = directory.get("u1").await.unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.last_email_sent, Some(now()));
        assert_eq!(stored.first_name, "Grace");
        assert_eq!(stored.last_name, "Hopper");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_copy_after_delivery_does_not_resend() {
        let directory = Arc::new(InMemoryDirectory::new(vec![user(0)]));
        let transport = Scripted::new(vec![true, true]);
        let (machine, timers) = machine(transport.clone(), directory.clone(), 3);

        machine.schedule(user(0), now());
        machine.schedule(user(0), now() + chrono::Duration::minutes(30));
        timers.wait_idle().await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let stored = directory.get("u1").await.unwrap();
        assert_eq!(stored.last_email_sent, Some(now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_at_cap_makes_final_attempt() {
        let directory = Arc::new(InMemoryDirectory::new(vec![user(3)]));
        let transport = Scripted::new(vec![false]);
        let (machine, timers) = machine(transport.clone(), directory.clone(), 3);

        let outcome = machine.resume(user(3)).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Exhausted);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending(), 0);

        let stored = directory.get("u1").await.unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.last_email_sent, Some(now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_below_cap_schedules_next_retry() {
        let directory = Arc::new(InMemoryDirectory::new(vec![user(1)]));
        let transport = Scripted::new(vec![false]);
        let (machine, timers) = machine(transport.clone(), directory.clone(), 3);

        let outcome = machine.resume(user(1)).await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::RetryScheduled {
                retry_count: 2,
                at: now() + chrono::Duration::hours(1)
            }
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(timers.has_pending("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_failure_propagates() {
        // The directory does not know this user.
        let directory = Arc::new(InMemoryDirectory::new(Vec::new()));
        let transport = Scripted::new(vec![false]);
        let (machine, timers) = machine(transport, directory, 3);

        let result = machine.fire(user(0)).await;
        assert!(matches!(result, Err(SchedulerError::Directory(_))));
        assert_eq!(timers.pending(), 0);
    }
}
