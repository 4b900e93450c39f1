//! Scheduler types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a user's delivery stands within one year.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Nothing armed.
    #[default]
    Idle,
    /// A timer is armed for the next attempt.
    Scheduled,
    /// The transport is being called.
    Attempting,
    /// Delivered; retry count reset.
    Success,
    /// Retry budget spent; abandoned for the year.
    Exhausted,
}

impl DeliveryState {
    /// Whether no further attempts follow this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Success | DeliveryState::Exhausted)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryState::Idle => "idle",
            DeliveryState::Scheduled => "scheduled",
            DeliveryState::Attempting => "attempting",
            DeliveryState::Success => "success",
            DeliveryState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Result of one fired timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Already emailed this year; nothing sent or written.
    AlreadySent,
    /// Email accepted by the transport.
    Delivered { at: DateTime<Utc> },
    /// Attempt failed; another is armed.
    RetryScheduled { retry_count: u32, at: DateTime<Utc> },
    /// Attempt failed with no budget left.
    Exhausted,
}

impl DeliveryOutcome {
    /// State the machine is left in.
    pub fn state(&self) -> DeliveryState {
        match self {
            DeliveryOutcome::AlreadySent => DeliveryState::Idle,
            DeliveryOutcome::Delivered { .. } => DeliveryState::Success,
            DeliveryOutcome::RetryScheduled { .. } => DeliveryState::Scheduled,
            DeliveryOutcome::Exhausted => DeliveryState::Exhausted,
        }
    }
}

/// What a sweep did with one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDisposition {
    /// A timer was armed.
    Armed,
    /// Nothing to do for this user now.
    Skipped,
    /// The user's record could not be scheduled.
    Rejected,
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Directory pages fetched.
    pub pages: u32,
    /// Users handed to the per-user action.
    pub visited: u32,
    pub armed: u32,
    pub skipped: u32,
    /// Users with a bad zone or birth date.
    pub rejected: u32,
}

impl SweepReport {
    pub(crate) fn record(&mut self, disposition: UserDisposition) {
        self.visited += 1;
        match disposition {
            UserDisposition::Armed => self.armed += 1,
            UserDisposition::Skipped => self.skipped += 1,
            UserDisposition::Rejected => self.rejected += 1,
        }
    }
}
