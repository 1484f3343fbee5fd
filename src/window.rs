//! Calendar windows used as aggregation buckets.
//!
//! Windows are Monday–Sunday weeks in the report timezone. They are derived from
//! "today" and an offset and are never stored on their own; a window's start date
//! is the key component that addresses persisted summaries.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// One inclusive `[start, end]` week.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PeriodWindow {
    /// The Monday–Sunday week containing `date`.
    pub fn week_containing(date: NaiveDate) -> Self {
        let start = date - Duration::days(date.weekday().num_days_from_monday() as i64);
        PeriodWindow {
            start,
            end: start + Duration::days(6),
        }
    }

    /// The week `offset` weeks before the one containing `today` (0 = current week).
    pub fn weeks_back(today: NaiveDate, offset: u32) -> Self {
        let current = Self::week_containing(today);
        let shift = Duration::weeks(offset as i64);
        PeriodWindow {
            start: current.start - shift,
            end: current.end - shift,
        }
    }

    /// The `count` most recent weeks, oldest first, ending with the current week.
    pub fn trailing(today: NaiveDate, count: u32) -> Vec<Self> {
        (0..count)
            .rev()
            .map(|offset| Self::weeks_back(today, offset))
            .collect()
    }

    /// The `count` most recent completed weeks, oldest first, excluding the current week.
    pub fn trailing_completed(today: NaiveDate, count: u32) -> Vec<Self> {
        (1..=count)
            .rev()
            .map(|offset| Self::weeks_back(today, offset))
            .collect()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// A window is completed once its last day is strictly before `today`.
    /// Completed windows are immutable.
    pub fn is_completed(&self, today: NaiveDate) -> bool {
        self.end < today
    }

    /// Start date formatted as it appears in store keys.
    pub fn start_key(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl std::fmt::Display for PeriodWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Inclusive date range sent to the vendor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }

    /// Smallest range covering every window, or `None` for an empty slice.
    pub fn covering(windows: &[PeriodWindow]) -> Option<Self> {
        let start = windows.iter().map(|w| w.start).min()?;
        let end = windows.iter().map(|w| w.end).max()?;
        Some(DateRange { start, end })
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Source of "now". Injected so window boundaries are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date in the report timezone.
    fn today(&self, tz: Tz) -> NaiveDate {
        self.now().with_timezone(&tz).date_naive()
    }
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        FixedClock {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_week_containing_is_monday_aligned() {
        // 2024-05-15 is a Wednesday
        let w = PeriodWindow::week_containing(date(2024, 5, 15));
        assert_eq!(w.start, date(2024, 5, 13));
        assert_eq!(w.end, date(2024, 5, 19));
        assert_eq!(w.days(), 7);

        let sunday = PeriodWindow::week_containing(date(2024, 5, 19));
        assert_eq!(sunday, w);
    }

    #[test]
    fn test_trailing_is_oldest_first_and_contiguous() {
        let windows = PeriodWindow::trailing(date(2024, 5, 15), 12);
        assert_eq!(windows.len(), 12);
        assert_eq!(windows.last().unwrap().start, date(2024, 5, 13));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end + Duration::days(1), pair[1].start);
        }
    }

    #[test]
    fn test_trailing_completed_excludes_current() {
        let today = date(2024, 5, 15);
        let windows = PeriodWindow::trailing_completed(today, 4);
        assert_eq!(windows.len(), 4);
        assert!(windows.iter().all(|w| w.is_completed(today)));
        assert_eq!(windows.last().unwrap().end, date(2024, 5, 12));
    }

    #[test]
    fn test_completion_is_strict() {
        let w = PeriodWindow::week_containing(date(2024, 5, 15));
        assert!(!w.is_completed(date(2024, 5, 19)));
        assert!(w.is_completed(date(2024, 5, 20)));
    }

    #[test]
    fn test_covering_range() {
        let windows = PeriodWindow::trailing(date(2024, 5, 15), 3);
        let range = DateRange::covering(&windows).unwrap();
        assert_eq!(range.start, date(2024, 4, 29));
        assert_eq!(range.end, date(2024, 5, 19));
        assert!(DateRange::covering(&[]).is_none());
    }

    #[test]
    fn test_clock_today_uses_timezone() {
        // 03:00 UTC on the 20th is still the 19th in Los Angeles
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 20, 3, 0, 0).unwrap());
        assert_eq!(
            clock.today(chrono_tz::America::Los_Angeles),
            date(2024, 5, 19)
        );
        assert_eq!(clock.today(chrono_tz::UTC), date(2024, 5, 20));

        clock.set(Utc.with_ymd_and_hms(2024, 5, 21, 12, 0, 0).unwrap());
        assert_eq!(clock.today(chrono_tz::UTC), date(2024, 5, 21));
    }
}
