//! Weekly reset boundary: Tuesday 07:00 in America/Los_Angeles.
//!
//! Every "since" cutoff in the crate comes from here, so the arithmetic is
//! done in zoned local time and survives DST transitions.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::LedgerError;

pub const RESET_ZONE: Tz = chrono_tz::America::Los_Angeles;
pub const RESET_WEEKDAY: Weekday = Weekday::Tue;
pub const RESET_HOUR: u32 = 7;

/// Source of "now". Production uses the system clock; tests pin it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Most recent reset at or before `now`.
pub fn weekly_reset_at(now: DateTime<Utc>) -> DateTime<Utc> {
    weekly_reset_in(now, RESET_ZONE)
}

pub fn weekly_reset_in(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let back = (local.weekday().num_days_from_monday() + 7
        - RESET_WEEKDAY.num_days_from_monday())
        % 7;
    let day = local.date_naive() - Duration::days(i64::from(back));
    let mut reset = reset_on(day, tz);
    if now < reset {
        reset = reset_on(day - Duration::days(7), tz);
    }
    reset
}

/// The reset instant on a given local calendar day.
fn reset_on(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = day.and_hms_opt(RESET_HOUR, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
        // 07:00 never falls in a gap for the reset zone; step past it anyway.
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

/// Parse an ISO-8601 / RFC 3339 timestamp, fractional seconds optional.
pub fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LedgerError::Malformed("empty timestamp".into()));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Malformed(format!("timestamp '{value}': {e}")))
}
