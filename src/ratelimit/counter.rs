//! Window units and the per-key counter entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time unit used to express a counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of one unit of this window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// Get the duration of `units` consecutive units, e.g. 15 minutes.
    pub fn times(&self, units: u32) -> Duration {
        self.duration() * units
    }
}

/// Requests observed for one key in its current window.
///
/// While `now < window_end` the count only grows. Once `now >= window_end`
/// the entry is logically expired and the next increment starts over at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests observed in the current window
    pub count: u64,
    /// When the current window resets
    pub window_end: DateTime<Utc>,
}

impl CounterEntry {
    /// Start a fresh window at `now` with a count of one.
    pub fn first(now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            count: 1,
            window_end: deadline(now, ttl),
        }
    }

    /// Whether the window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }

    /// Quota left under `limit`, never negative.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.count)
    }

    /// Get the duration until the window resets.
    pub fn duration_until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.window_end - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// `now + ttl`, saturating at the latest representable instant.
pub(crate) fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_units() {
        assert_eq!(TimeWindow::Second.times(1), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.times(15), Duration::from_secs(900));
        assert_eq!(TimeWindow::Hour.times(2), TimeWindow::Minute.times(120));
        assert_eq!(TimeWindow::Day.times(1), TimeWindow::Hour.times(24));
    }

    #[test]
    fn test_entry_expires_at_window_end() {
        let now = Utc::now();
        let entry = CounterEntry::first(now, Duration::from_millis(1000));

        assert_eq!(entry.count, 1);
        assert!(!entry.is_expired(now));
        assert!(!entry.is_expired(now + chrono::Duration::milliseconds(999)));
        assert!(entry.is_expired(now + chrono::Duration::milliseconds(1000)));
    }

    #[test]
    fn test_entry_remaining_saturates() {
        let entry = CounterEntry {
            count: 7,
            window_end: Utc::now(),
        };
        assert_eq!(entry.remaining(10), 3);
        assert_eq!(entry.remaining(5), 0);
    }

    #[test]
    fn test_duration_until_reset() {
        let now = Utc::now();
        let entry = CounterEntry::first(now, Duration::from_secs(60));

        assert_eq!(entry.duration_until_reset(now), Duration::from_secs(60));
        assert_eq!(
            entry.duration_until_reset(now + chrono::Duration::seconds(90)),
            Duration::ZERO
        );
    }
}
