//! Sliding-window log arithmetic.
//!
//! [`SlidingWindow::plan`] is the body of every log transaction. It is a pure
//! function of the snapshot the store read, which keeps the admission rule
//! testable without a store.

use std::time::Duration;

use crate::store::{LogEntry, LogSnapshot, LogWrite};

/// Default window size.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// A trailing time window with an admission ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    size: Duration,
    limit: u64,
}

impl SlidingWindow {
    pub fn new(size: Duration, limit: u64) -> Self {
        Self { size, limit }
    }

    /// Window size.
    pub fn size(&self) -> Duration {
        self.size
    }

    /// Maximum admissions inside one window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn size_nanos(&self) -> i64 {
        i64::try_from(self.size.as_nanos()).unwrap_or(i64::MAX)
    }

    /// Entries scored at or below this bound no longer count at `now`.
    pub fn clear_before(&self, now: i64) -> i64 {
        now.saturating_sub(self.size_nanos())
    }

    /// Decide the log write for an attempt at `now`.
    ///
    /// Stale entries are always pruned. A new entry scored at `now` is added
    /// only while the live count is below the limit; `member` is called only
    /// in that case.
    pub fn plan(&self, now: i64, snapshot: LogSnapshot, member: impl FnOnce() -> String) -> LogWrite {
        let insert = (snapshot.live < self.limit).then(|| LogEntry {
            score: now,
            member: member(),
        });

        LogWrite {
            prune_through: self.clear_before(now),
            insert,
        }
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, 50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    fn snapshot(live: u64) -> LogSnapshot {
        LogSnapshot { live }
    }

    #[test]
    fn test_clear_before() {
        let window = SlidingWindow::new(Duration::from_secs(1), 2);
        assert_eq!(window.clear_before(1_010 * MS), 10 * MS);
        assert_eq!(window.clear_before(i64::MIN + 1), i64::MIN);
    }

    #[test]
    fn test_plan_admits_below_limit() {
        let window = SlidingWindow::new(Duration::from_secs(1), 2);
        let write = window.plan(5 * MS, snapshot(1), || "token".to_string());

        assert_eq!(
            write.insert,
            Some(LogEntry {
                score: 5 * MS,
                member: "token".to_string()
            })
        );
        assert_eq!(write.prune_through, 5 * MS - 1_000 * MS);
    }

    #[test]
    fn test_plan_rejects_at_limit() {
        let window = SlidingWindow::new(Duration::from_secs(1), 2);
        let write = window.plan(5 * MS, snapshot(2), || panic!("no member for a rejection"));

        assert!(write.insert.is_none());
        assert_eq!(write.prune_through, window.clear_before(5 * MS));
    }

    #[test]
    fn test_plan_rejects_above_limit() {
        // A lowered limit leaves more live entries than allowed.
        let window = SlidingWindow::new(Duration::from_secs(1), 1);
        assert!(window.plan(0, snapshot(3), String::new).insert.is_none());
    }

    #[test]
    fn test_default_window() {
        let window = SlidingWindow::default();
        assert_eq!(window.size(), Duration::from_secs(1));
        assert_eq!(window.limit(), 50);
    }
}
