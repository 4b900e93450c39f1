//! Orchestration entry points.

use std::sync::Arc;

use chrono::Datelike;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cake_directory::{DirectoryGateway, UserRecord};
use cake_mailer::EmailTransport;

use crate::calendar::{BirthdaySchedule, sent_this_year};
use crate::{
    DeliveryExecutor, RetryMachine, SchedulerConfig, SchedulerError, SweepDriver, SweepReport,
    TimerScheduler, UserDisposition,
};

/// Schedules birthday emails for the whole directory.
///
/// Every entry point is idempotent and safe to run again at any time: a
/// send that already happened this year is never repeated.
#[derive(Clone)]
pub struct BirthdayScheduler {
    sweeps: SweepDriver,
    machine: RetryMachine,
    timers: TimerScheduler,
    config: Arc<SchedulerConfig>,
}

impl BirthdayScheduler {
    pub fn new(
        directory: Arc<dyn DirectoryGateway>,
        transport: Arc<dyn EmailTransport>,
        timers: TimerScheduler,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let executor = DeliveryExecutor::new(transport, config.attempt_timeout);
        let machine = RetryMachine::new(Arc::clone(&directory), executor, timers.clone(), &config);
        Ok(Self {
            sweeps: SweepDriver::new(directory, config.page_size),
            machine,
            timers,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn timers(&self) -> &TimerScheduler {
        &self.timers
    }

    /// Arm this year's send for every user whose birthday is not yet behind them.
    ///
    /// Users that already have a timer in this process are left alone.
    #[tracing::instrument(skip(self))]
    pub async fn schedule_all_birthdays(&self) -> Result<SweepReport, SchedulerError> {
        let now = self.timers.now();
        let send_time = self.config.send_time;

        let report = self
            .sweeps
            .sweep(|user| {
                let Some(schedule) = self.calendar(&user) else {
                    return UserDisposition::Rejected;
                };
                if self.timers.has_pending(&user.id) {
                    return UserDisposition::Skipped;
                }
                match schedule.send_this_year(now, send_time) {
                    Some(at) => {
                        self.machine.schedule(user, at);
                        UserDisposition::Armed
                    }
                    None => UserDisposition::Skipped,
                }
            })
            .await?;

        info!(
            pages = report.pages,
            visited = report.visited,
            armed = report.armed,
            skipped = report.skipped,
            rejected = report.rejected,
            "scheduled all birthdays"
        );
        Ok(report)
    }

    /// Arm today's send for users whose local date is their birthday.
    #[tracing::instrument(skip(self))]
    pub async fn daily_birthday_check(&self) -> Result<SweepReport, SchedulerError> {
        let now = self.timers.now();
        let send_time = self.config.send_time;

        let report = self
            .sweeps
            .sweep(|user| {
                let Some(schedule) = self.calendar(&user) else {
                    return UserDisposition::Rejected;
                };
                if !schedule.is_birthday(now)
                    || sent_this_year(&user, now)
                    || self.timers.has_pending(&user.id)
                {
                    return UserDisposition::Skipped;
                }

                let at = schedule.send_instant(schedule.local_date(now).year(), send_time);
                self.machine.schedule(user, at);
                UserDisposition::Armed
            })
            .await?;

        info!(
            pages = report.pages,
            visited = report.visited,
            armed = report.armed,
            skipped = report.skipped,
            rejected = report.rejected,
            "daily birthday check complete"
        );
        Ok(report)
    }

    /// Resume the retry handler for every never-emailed user.
    ///
    /// Users with a live timer in this process are skipped. A user already at
    /// the retry cap gets one final attempt.
    #[tracing::instrument(skip(self))]
    pub async fn retry_all_unsent_emails(&self) -> Result<SweepReport, SchedulerError> {
        let now = self.timers.now();

        let report = self
            .sweeps
            .sweep_unsent(|user| {
                if self.calendar(&user).is_none() {
                    return UserDisposition::Rejected;
                }
                if self.timers.has_pending(&user.id) {
                    return UserDisposition::Skipped;
                }

                let machine = self.machine.clone();
                self.timers.arm_at(
                    user.id.clone(),
                    now,
                    Box::pin(async move { machine.resume(user).await.map(|_| ()) }),
                );
                UserDisposition::Armed
            })
            .await?;

        info!(
            visited = report.visited,
            armed = report.armed,
            skipped = report.skipped,
            rejected = report.rejected,
            "retried unsent emails"
        );
        Ok(report)
    }

    /// Arm the daily trigger: the birthday check, then the unsent sweep.
    ///
    /// Failures are logged; the next day's run tries again.
    pub fn start_daily_trigger(&self) -> JoinHandle<()> {
        let this = self.clone();
        self.timers.arm_recurring(
            self.config.daily_trigger.clone(),
            self.config.host_zone,
            move || {
                let this = this.clone();
                Box::pin(async move {
                    this.run_daily().await;
                    Ok(())
                })
            },
        )
    }

    /// One daily run. Each step's failure is logged and does not stop the next.
    pub async fn run_daily(&self) {
        if let Err(e) = self.daily_birthday_check().await {
            error!(error = %e, "daily birthday check failed");
        }
        if let Err(e) = self.retry_all_unsent_emails().await {
            error!(error = %e, "unsent email sweep failed");
        }
    }

    fn calendar(&self, user: &UserRecord) -> Option<BirthdaySchedule> {
        match BirthdaySchedule::for_user(user) {
            Ok(schedule) => Some(schedule),
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "skipping user with invalid calendar data");
                None
            }
        }
    }
}
