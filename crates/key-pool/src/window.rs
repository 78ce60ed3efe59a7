//! Trailing 60-second request window
//!
//! Each credential keeps the instants of its recent requests. Entries are pruned
//! lazily: every read that depends on the count prunes first, so a count is never
//! computed over stale entries.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Width of the per-minute window, in seconds.
pub const WINDOW_SECS: i64 = 60;

/// Request instants within the trailing minute, oldest first.
#[derive(Debug, Clone, Default)]
pub struct MinuteWindow {
    hits: VecDeque<DateTime<Utc>>,
}

impl MinuteWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request at `at`.
    ///
    /// Out-of-order instants (concurrent callers reading the clock before taking
    /// the pool lock) are inserted in position so pruning stays a front scan.
    pub fn record(&mut self, at: DateTime<Utc>) {
        match self.hits.back() {
            Some(last) if *last > at => {
                let idx = self.hits.partition_point(|hit| *hit <= at);
                self.hits.insert(idx, at);
            }
            _ => self.hits.push_back(at),
        }
    }

    /// Drop every entry at or before `now - 60s`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(WINDOW_SECS);
        while let Some(front) = self.hits.front() {
            if *front <= cutoff {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Requests within the trailing minute as of `now`.
    pub fn count(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        self.hits.len() as u32
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }
}
