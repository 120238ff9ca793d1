//! Expiration scheduling and the injectable time source.
//!
//! All functions here are pure given `now`. Calendar boundaries (midnight,
//! week start, month start) are computed in a fixed UTC offset so results are
//! reproducible regardless of the host time zone.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};

/// Source of the current Unix timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Expiration frequency parsed from a keyword or a number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expire {
    Second,
    ThirtySecond,
    Minute,
    Hourly,
    Workday,
    Halfday,
    Nightly,
    Weekly,
    Monthly,
    Seconds(i64),
}

impl Expire {
    /// Parse an expiration keyword or number of seconds. Unknown keywords fall back to `Nightly`.
    pub fn parse(value: &str) -> Self {
        Self::parse_known(value).unwrap_or(Expire::Nightly)
    }

    /// Whether `value` names a keyword or a number rather than hitting the fallback.
    pub fn is_known(value: &str) -> bool {
        Self::parse_known(value).is_some()
    }

    fn parse_known(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(secs) = value.parse::<i64>() {
            return Some(Expire::Seconds(secs));
        }

        match value {
            "second" => Some(Expire::Second),
            "30-second" => Some(Expire::ThirtySecond),
            "minute" => Some(Expire::Minute),
            "hourly" => Some(Expire::Hourly),
            "workday" => Some(Expire::Workday),
            "halfday" => Some(Expire::Halfday),
            "nightly" => Some(Expire::Nightly),
            "weekly" => Some(Expire::Weekly),
            "monthly" => Some(Expire::Monthly),
            _ => None,
        }
    }
}

/// Convert a Unix timestamp into the given zone.
pub fn localize(now: i64, tz: FixedOffset) -> DateTime<FixedOffset> {
    DateTime::from_timestamp(now, 0).unwrap_or_default().with_timezone(&tz)
}

/// Timestamp of a wall-clock time in `tz`. Fixed offsets have no gaps, so this
/// is always single-valued.
fn at(tz: FixedOffset, naive: NaiveDateTime) -> i64 {
    tz.from_local_datetime(&naive).single().map(|dt| dt.timestamp()).unwrap_or_else(|| naive.and_utc().timestamp())
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Next midnight after `now` in `tz`.
fn next_midnight(now: DateTime<FixedOffset>) -> i64 {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(NaiveDate::MAX);
    at(*now.offset(), midnight(tomorrow))
}

/// Timestamp of the next expiration for `expire`, plus `offset` seconds.
///
/// Saturates at the `i64` range instead of overflowing.
pub fn next_expire(expire: Expire, offset: i64, now: DateTime<FixedOffset>) -> i64 {
    let tz = *now.offset();
    let ts = now.timestamp();
    let hour_start = ts - i64::from(now.minute()) * 60 - i64::from(now.second());

    let time = match expire {
        Expire::Seconds(secs) => ts.saturating_add(secs),
        Expire::Second => ts + 1,
        Expire::ThirtySecond => ts + 30,
        Expire::Minute => ts - i64::from(now.second()) + 60,
        Expire::Hourly => hour_start + 3600,
        Expire::Workday => hour_start + 8 * 3600,
        Expire::Halfday => hour_start + 12 * 3600,
        Expire::Nightly => next_midnight(now),
        Expire::Weekly => {
            let monday = now.date_naive() - Duration::days(i64::from(now.weekday().num_days_from_monday()));
            at(tz, midnight(monday + Duration::days(7)))
        }
        Expire::Monthly => {
            let first = now.date_naive().with_day(1).unwrap_or_else(|| now.date_naive());
            let next = first.checked_add_months(Months::new(1)).unwrap_or(NaiveDate::MAX);
            at(tz, midnight(next))
        }
    };

    time.saturating_add(offset)
}

/// Timestamp of the next cleanup: tomorrow's midnight plus `hours_past_midnight`.
pub fn next_cleanup(hours_past_midnight: u32, now: DateTime<FixedOffset>) -> i64 {
    next_midnight(now) + i64::from(hours_past_midnight) * 3600
}

/// Any integer at least this large is treated as an absolute timestamp
/// (it falls after 1971-01-01); anything smaller is a delay in seconds.
const ABSOLUTE_TIMESTAMP_FLOOR: i64 = 31_536_000;

/// Interpret a rate-limit reset header captured at `captured_at`.
///
/// Accepts a Unix timestamp, a delay in seconds, or an RFC 2822 / RFC 3339 date.
pub fn parse_reset_time(value: &str, captured_at: i64) -> Option<i64> {
    let value = value.trim();

    if let Ok(n) = value.parse::<i64>() {
        return Some(if n >= ABSOLUTE_TIMESTAMP_FLOOR { n } else { captured_at.saturating_add(n) });
    }

    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.timestamp())
        .ok()
}
