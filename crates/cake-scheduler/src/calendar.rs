//! Local-time send instants for birthdays.
//!
//! Everything here is pure: a [`BirthdaySchedule`] pairs a birth date with the
//! user's zone and answers "when, in UTC, is 09:00 local on the birthday in
//! year Y".

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;

use cake_directory::UserRecord;

use crate::SchedulerError;

/// 09:00, the default local send time.
pub fn default_send_time() -> NaiveTime {
    NaiveTime::MIN + Duration::hours(9)
}

/// Parse an IANA zone name such as `America/Sao_Paulo`.
pub fn parse_timezone(location: &str) -> Option<Tz> {
    location.trim().parse::<Tz>().ok()
}

/// Parse a birth date given as `YYYY-MM-DD` or as an RFC 3339 timestamp.
///
/// Timestamps contribute the calendar date as written; the time is ignored.
pub fn parse_birth_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

/// Resolve a local wall-clock time to an instant.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times inside
/// a gap (clocks going forward) move forward by one hour.
pub fn resolve_local(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => tz
            .from_local_datetime(&(local + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local)),
    }
}

/// Date of `at` on the wall calendar of `tz`.
pub fn local_date(tz: &Tz, at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(tz).date_naive()
}

/// Year of `at` on the wall calendar of `tz`.
pub fn local_year(tz: &Tz, at: DateTime<Utc>) -> i32 {
    local_date(tz, at).year()
}

/// Whether `user` was already emailed in the year containing `now`.
///
/// The year is the user's local year, or the UTC year when their location is
/// not a known zone.
pub fn sent_this_year(user: &UserRecord, now: DateTime<Utc>) -> bool {
    let tz = parse_timezone(&user.location).unwrap_or(Tz::UTC);
    user.last_email_sent
        .is_some_and(|sent| local_year(&tz, sent) == local_year(&tz, now))
}

/// A user's birthday anchored in their timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BirthdaySchedule {
    birth: NaiveDate,
    tz: Tz,
}

impl BirthdaySchedule {
    pub fn new(birth: NaiveDate, tz: Tz) -> Self {
        Self { birth, tz }
    }

    /// Build the schedule for a directory record.
    ///
    /// A bad birth date or zone only affects this user; the caller logs it
    /// and moves on.
    pub fn for_user(user: &UserRecord) -> Result<Self, SchedulerError> {
        let tz = parse_timezone(&user.location).ok_or_else(|| SchedulerError::InvalidTimezone {
            user_id: user.id.clone(),
            location: user.location.clone(),
        })?;
        let birth =
            parse_birth_date(&user.date_of_birth).ok_or_else(|| SchedulerError::InvalidBirthDate {
                user_id: user.id.clone(),
                value: user.date_of_birth.clone(),
            })?;
        Ok(Self::new(birth, tz))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The birthday's calendar date in `year`. Feb 29 becomes Feb 28 when
    /// `year` is not a leap year.
    pub fn birthday_in(&self, year: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, self.birth.month(), self.birth.day())
            .or_else(|| NaiveDate::from_ymd_opt(year, 2, 28))
            .unwrap_or(self.birth)
    }

    /// Instant at which `send_time` local falls on the birthday in `year`.
    pub fn send_instant(&self, year: i32, send_time: NaiveTime) -> DateTime<Utc> {
        resolve_local(&self.tz, self.birthday_in(year).and_time(send_time))
    }

    /// Today's date in the user's zone.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        local_date(&self.tz, now)
    }

    /// Whether the user's local date at `now` is their birthday.
    pub fn is_birthday(&self, now: DateTime<Utc>) -> bool {
        let today = self.local_date(now);
        self.birthday_in(today.year()) == today
    }

    /// This year's send instant, unless the birthday is already behind the
    /// user. On the birthday itself the instant may lie in the past.
    pub fn send_this_year(&self, now: DateTime<Utc>, send_time: NaiveTime) -> Option<DateTime<Utc>> {
        let today = self.local_date(now);
        (self.birthday_in(today.year()) >= today)
            .then(|| self.send_instant(today.year(), send_time))
    }

    /// The next send instant at or after `now`'s local day.
    pub fn next_send(&self, now: DateTime<Utc>, send_time: NaiveTime) -> DateTime<Utc> {
        self.send_this_year(now, send_time).unwrap_or_else(|| {
            self.send_instant(self.local_date(now).year() + 1, send_time)
        })
    }
}
