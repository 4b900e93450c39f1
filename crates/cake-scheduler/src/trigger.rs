//! Daily cron-like trigger.
//!
//! Supports the five-field form `MIN HOUR DOM MON DOW` where the last three
//! fields are `*`. Minute and hour accept `N`, `*`, `*/N` and comma lists.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::SchedulerError;

/// A trigger that fires at fixed wall-clock times every day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyTrigger {
    expression: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
}

impl DailyTrigger {
    /// `0 0 * * *`: local midnight.
    pub fn midnight() -> Self {
        Self {
            expression: "0 0 * * *".to_string(),
            minutes: vec![0],
            hours: vec![0],
        }
    }

    /// The expression this trigger was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire instant strictly after `after`, on the wall clock of
    /// `after`'s zone. Wall times skipped by a DST gap are passed over.
    pub fn next_after<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Utc>> {
        let zone = after.timezone();
        let local = after.naive_local();

        // Two days always contain a match; the third covers a fully skipped day.
        for offset in 0..3 {
            let date = local.date() + Duration::days(offset);
            for &hour in &self.hours {
                for &minute in &self.minutes {
                    let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                        continue;
                    };
                    let candidate = date.and_time(time);
                    if candidate <= local {
                        continue;
                    }
                    if let Some(at) = zone.from_local_datetime(&candidate).earliest() {
                        return Some(at.with_timezone(&Utc));
                    }
                }
            }
        }
        None
    }
}

impl Default for DailyTrigger {
    fn default() -> Self {
        Self::midnight()
    }
}

impl fmt::Display for DailyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for DailyTrigger {
    type Err = SchedulerError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidTrigger(format!(
                "{:?}: need 5 fields (MIN HOUR DOM MON DOW)",
                expression
            )));
        }
        if fields[2..].iter().any(|f| *f != "*") {
            return Err(SchedulerError::InvalidTrigger(format!(
                "{:?}: only daily triggers are supported (DOM MON DOW must be *)",
                expression
            )));
        }

        let minutes = parse_field(fields[0], 59).ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!("{:?}: bad minute field", expression))
        })?;
        let hours = parse_field(fields[1], 23).ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!("{:?}: bad hour field", expression))
        })?;

        Ok(Self {
            expression: fields.join(" "),
            minutes,
            hours,
        })
    }
}

/// Parse one field into sorted, distinct values in `0..=max`.
fn parse_field(field: &str, max: u32) -> Option<Vec<u32>> {
    let mut values: Vec<u32> = if field == "*" {
        (0..=max).collect()
    } else if let Some(step) = field.strip_prefix("*/") {
        let n: usize = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        (0..=max).step_by(n).collect()
    } else {
        field
            .split(',')
            .map(|v| v.trim().parse::<u32>().ok().filter(|n| *n <= max))
            .collect::<Option<_>>()?
    };

    values.sort_unstable();
    values.dedup();
    (!values.is_empty()).then_some(values)
}

/// Zone in which the daily trigger's wall-clock times are read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostZone {
    /// The process's local zone.
    #[default]
    Local,
    Named(Tz),
}

impl HostZone {
    /// Next time `trigger` fires after `now`, read in this zone.
    pub fn next_fire(&self, trigger: &DailyTrigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            HostZone::Local => trigger.next_after(&now.with_timezone(&chrono::Local)),
            HostZone::Named(tz) => trigger.next_after(&now.with_timezone(tz)),
        }
    }
}

impl fmt::Display for HostZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostZone::Local => f.write_str("local"),
            HostZone::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}
