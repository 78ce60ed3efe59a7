//! Pooled credential record
//!
//! One record per API key: budgets, usage counters, health status and timestamps.
//! Records are owned by the pool and only mutated under its lock; nothing outside
//! the pool holds a reference to one across calls.

use chrono::{DateTime, Duration, Utc};
use common::Secret;
use tracing::{info, warn};

use crate::quota::FailureKind;
use crate::window::MinuteWindow;

/// Runtime status of a pooled key.
///
/// Transitions:
/// - Active → Exhausted (daily budget spent, or upstream reported daily quota)
/// - Active → Cooldown (consecutive non-quota failures reached the threshold)
/// - Cooldown → Active (cooldown elapsed, observed lazily)
/// - Exhausted → Active (civil-date rollover or admin reset)
/// - any → Disabled (admin), Disabled → Active (admin)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    Exhausted,
    Disabled,
    Cooldown { until: DateTime<Utc> },
}

impl CredentialStatus {
    /// Status label for status views and logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Exhausted => "exhausted",
            CredentialStatus::Disabled => "disabled",
            CredentialStatus::Cooldown { .. } => "cooldown",
        }
    }
}

/// How repeated non-quota failures are handled.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    /// Consecutive `Other` failures that put a key into cooldown.
    pub threshold: u32,
    pub cooldown: Duration,
}

/// A pooled API key with its budgets and usage.
#[derive(Debug)]
pub struct Credential {
    pub(crate) id: String,
    /// Insertion order, for deterministic tie-breaking and listing.
    pub(crate) seq: u64,
    pub(crate) secret: Secret<String>,
    pub(crate) daily_limit: u32,
    pub(crate) minute_limit: u32,
    pub(crate) daily_used: u32,
    pub(crate) window: MinuteWindow,
    pub(crate) status: CredentialStatus,
    pub(crate) last_used: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<DateTime<Utc>>,
    pub(crate) consecutive_failures: u32,
}

impl Credential {
    pub(crate) fn new(
        id: String,
        seq: u64,
        secret: Secret<String>,
        daily_limit: u32,
        minute_limit: u32,
    ) -> Self {
        Self {
            id,
            seq,
            secret,
            daily_limit,
            minute_limit,
            daily_used: 0,
            window: MinuteWindow::new(),
            status: CredentialStatus::Active,
            last_used: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn daily_remaining(&self) -> u32 {
        self.daily_limit.saturating_sub(self.daily_used)
    }

    /// Requests in the trailing minute, pruning stale entries first.
    pub fn minute_count(&mut self, now: DateTime<Utc>) -> u32 {
        self.window.count(now)
    }

    /// Active, with daily and per-minute budget left.
    pub fn is_eligible(&mut self, now: DateTime<Utc>) -> bool {
        self.status == CredentialStatus::Active
            && self.daily_used < self.daily_limit
            && self.minute_count(now) < self.minute_limit
    }

    pub(crate) fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, CredentialStatus::Cooldown { until } if now >= until)
    }

    pub(crate) fn end_cooldown(&mut self) {
        info!(key_id = %self.id, "cooldown expired, key active again");
        self.status = CredentialStatus::Active;
        self.consecutive_failures = 0;
    }

    /// Daily rollover: budget restored, exhaustion cleared.
    pub(crate) fn reset_daily(&mut self) {
        self.daily_used = 0;
        self.consecutive_failures = 0;
        if self.status == CredentialStatus::Exhausted {
            self.status = CredentialStatus::Active;
        }
    }

    /// Admin reset: like the daily rollover, but also clears the minute window and
    /// ends any cooldown.
    pub(crate) fn reset_all(&mut self) {
        self.daily_used = 0;
        self.consecutive_failures = 0;
        self.window.clear();
        if self.status != CredentialStatus::Disabled {
            self.status = CredentialStatus::Active;
        }
    }

    /// Charge one request at `at`. `daily_used` never exceeds `daily_limit`.
    pub(crate) fn charge(&mut self, at: DateTime<Utc>) {
        if self.daily_used >= self.daily_limit {
            warn!(key_id = %self.id, "request charged to a key with no daily budget left");
        }
        self.daily_used = (self.daily_used + 1).min(self.daily_limit);
        self.window.record(at);
        self.last_used = Some(at);

        if self.daily_used >= self.daily_limit && self.status == CredentialStatus::Active {
            info!(
                key_id = %self.id,
                daily_limit = self.daily_limit,
                "daily budget spent, key exhausted"
            );
            self.status = CredentialStatus::Exhausted;
        }
    }

    /// A request on this key succeeded; the failure streak is broken.
    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Apply an upstream failure outcome.
    pub(crate) fn apply_failure(
        &mut self,
        kind: FailureKind,
        at: DateTime<Utc>,
        policy: &FailurePolicy,
    ) {
        self.last_error = Some(at);
        match kind {
            FailureKind::DailyExhausted => {
                self.consecutive_failures = 0;
                self.daily_used = self.daily_limit;
                if self.status != CredentialStatus::Disabled {
                    self.status = CredentialStatus::Exhausted;
                }
                warn!(key_id = %self.id, "upstream reported daily quota exhausted");
            }
            FailureKind::RateLimited => {
                // Absorbed by the minute-window filter on the next selection.
                self.consecutive_failures = 0;
            }
            FailureKind::Other => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= policy.threshold
                    && self.status == CredentialStatus::Active
                {
                    let until = at + policy.cooldown;
                    warn!(
                        key_id = %self.id,
                        consecutive_failures = self.consecutive_failures,
                        cooldown_secs = policy.cooldown.num_seconds(),
                        "key entering cooldown"
                    );
                    self.status = CredentialStatus::Cooldown { until };
                }
            }
        }
    }
}
