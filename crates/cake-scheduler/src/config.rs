//! Scheduler configuration.

use std::time::Duration;

use chrono::NaiveTime;

use crate::calendar::default_send_time;
use crate::{DailyTrigger, HostZone, SchedulerError};

/// Default retry budget after the first failed send.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// Default directory page size.
pub const DEFAULT_PAGE_SIZE: u32 = 4;

/// Tunables for the birthday scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Retries allowed after the first failure. Zero makes every failure final.
    pub max_retry_count: u32,
    /// Fixed delay between attempts.
    pub retry_interval: Duration,
    /// Local time of day at which birthday emails go out.
    pub send_time: NaiveTime,
    /// Users requested per directory page.
    pub page_size: u32,
    /// Upper bound on one delivery attempt.
    pub attempt_timeout: Duration,
    /// When the daily check runs.
    pub daily_trigger: DailyTrigger,
    /// Zone the daily trigger is read in.
    pub host_zone: HostZone,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            retry_interval: Duration::from_secs(3600),
            send_time: default_send_time(),
            page_size: DEFAULT_PAGE_SIZE,
            attempt_timeout: Duration::from_secs(30),
            daily_trigger: DailyTrigger::midnight(),
            host_zone: HostZone::Local,
        }
    }
}

impl SchedulerConfig {
    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.page_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "page size must be positive".to_string(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "retry interval must be positive".to_string(),
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "attempt timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry interval as a calendar duration.
    pub(crate) fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retry_interval).unwrap_or(chrono::Duration::hours(1))
    }
}
