//! Sources of "now".

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a chosen instant that then advances with tokio's clock.
///
/// Under a paused tokio runtime the reported time moves only when tokio's
/// virtual time does, which keeps timer tests deterministic.
#[derive(Debug)]
pub struct ManualClock {
    anchor: Mutex<(DateTime<Utc>, tokio::time::Instant)>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            anchor: Mutex::new((start, tokio::time::Instant::now())),
        }
    }

    /// Jump to `at`; time keeps advancing from there.
    pub fn set(&self, at: DateTime<Utc>) {
        let mut anchor = self.anchor.lock().unwrap_or_else(|e| e.into_inner());
        *anchor = (at, tokio::time::Instant::now());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let (at, since) = *self.anchor.lock().unwrap_or_else(|e| e.into_inner());
        at + chrono::Duration::from_std(since.elapsed()).unwrap_or_default()
    }
}
