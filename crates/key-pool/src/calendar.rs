//! Reset calendar and clock
//!
//! The provider resets daily quotas at local midnight in a fixed civil timezone
//! (Pacific time for Gemini). The UTC offset of that midnight moves with daylight
//! saving, so every date computation goes through `chrono-tz` rather than a fixed
//! offset.
//!
//! The pool never calls `Utc::now()` directly: it reads time from a [`Clock`], which
//! lets tests move time forward across minute windows and civil-date boundaries.

use std::sync::Mutex;

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Zone the upstream provider uses for its daily quota reset.
pub const DEFAULT_RESET_ZONE: Tz = chrono_tz::America::Los_Angeles;

/// Calendar date of `instant` as observed in the reset zone.
pub fn civil_date(instant: DateTime<Utc>, zone: Tz) -> NaiveDate {
    instant.with_timezone(&zone).date_naive()
}

/// UTC instant of the first local midnight in `zone` strictly after `instant`.
pub fn next_reset(instant: DateTime<Utc>, zone: Tz) -> DateTime<Utc> {
    let today = civil_date(instant, zone);
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    start_of_day(tomorrow, zone)
}

/// First valid local instant of `date` in `zone`, as UTC.
///
/// Midnight is ambiguous or missing in a few zones on transition days: ambiguous
/// resolves to the earlier instant, a gap rolls forward to the first valid minute.
pub fn start_of_day(date: NaiveDate, zone: Tz) -> DateTime<Utc> {
    let mut local = date.and_time(NaiveTime::MIN);
    for _ in 0..(24 * 60) {
        if let Some(resolved) = zone.from_local_datetime(&local).earliest() {
            return resolved.with_timezone(&Utc);
        }
        local += Duration::minutes(1);
    }
    // No zone has a day-long gap; fall back to interpreting the date as UTC.
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Source of wall-clock time for the pool.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
