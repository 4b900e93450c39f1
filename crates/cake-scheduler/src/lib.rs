//! Birthday notification scheduler for cake.
//!
//! Emails every user on their birthday at 09:00 in their own timezone, at
//! most once per year. A failed send is retried on a fixed interval up to a
//! configured budget, after which the year is abandoned.
//!
//! [`BirthdayScheduler`] exposes the three entry points:
//!
//! - `schedule_all_birthdays`: arm this year's send for every user
//! - `daily_birthday_check`: arm today's send for users whose birthday it is
//! - `retry_all_unsent_emails`: resume overdue sends for never-emailed users
//!
//! All state lives in the user directory. Timers are in-memory only; running
//! the entry points again after a restart re-derives whatever is still due.

pub mod calendar;
mod birthday;
mod clock;
mod config;
mod delivery;
mod error;
mod executor;
mod sweep;
mod timer;
mod trigger;
mod types;

pub use birthday::BirthdayScheduler;
pub use calendar::BirthdaySchedule;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DEFAULT_MAX_RETRY_COUNT, DEFAULT_PAGE_SIZE, SchedulerConfig};
pub use delivery::RetryMachine;
pub use error::SchedulerError;
pub use executor::DeliveryExecutor;
pub use sweep::SweepDriver;
pub use timer::{BoxFuture, PendingTimer, TimerId, TimerScheduler, TimerTask};
pub use trigger::{DailyTrigger, HostZone};
pub use types::{DeliveryOutcome, DeliveryState, SweepReport, UserDisposition};
