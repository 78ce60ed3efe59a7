//! Pool state and credential selection
//!
//! The pool owns every credential record behind a single mutex. Each public
//! operation takes the lock once, rolls time-dependent state forward (daily reset,
//! cooldown expiry, minute-window pruning), then does its read-modify-write. No I/O
//! happens while the lock is held.
//!
//! Selection picks the eligible key with the most remaining daily budget; ties go
//! to the key with fewer requests in the trailing minute, then to the oldest key.
//! Selecting does not charge the key: callers charge via `record_usage` once the
//! request is actually dispatched.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use common::Secret;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::calendar::{self, Clock, DEFAULT_RESET_ZONE, SystemClock};
use crate::credential::{Credential, CredentialStatus, FailurePolicy};
use crate::error::{Error, Result};
use crate::quota::FailureKind;

/// Pool-wide defaults and policies.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub default_daily_limit: u32,
    pub default_minute_limit: u32,
    /// Civil timezone in which the provider resets daily quotas.
    pub reset_zone: Tz,
    /// Consecutive non-quota failures before a key cools down.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: 250,
            default_minute_limit: 10,
            reset_zone: DEFAULT_RESET_ZONE,
            failure_threshold: 3,
            cooldown: Duration::seconds(60),
        }
    }
}

impl PoolConfig {
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            threshold: self.failure_threshold,
            cooldown: self.cooldown,
        }
    }
}

/// A key chosen for a request, ready to attach upstream.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub id: String,
    pub secret: Secret<String>,
}

/// Everything behind the pool lock.
#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) credentials: HashMap<String, Credential>,
    /// Civil date (reset zone) on which the last daily reset was applied.
    pub(crate) last_reset: NaiveDate,
    next_seq: u64,
}

/// Check-and-roll-forward on access: apply `advance` to `slot` if `due` says the
/// periodic transition is owed. Used for both the daily rollover and cooldown expiry.
fn roll_forward_if<T>(
    slot: &mut T,
    due: impl FnOnce(&T) -> bool,
    advance: impl FnOnce(&mut T),
) -> bool {
    if due(slot) {
        advance(slot);
        true
    } else {
        false
    }
}

impl PoolState {
    /// Bring time-dependent state up to `now`. Idempotent within a civil day.
    pub(crate) fn roll_forward(&mut self, now: DateTime<Utc>, zone: Tz) {
        let today = calendar::civil_date(now, zone);
        roll_forward_if(
            self,
            |state| today > state.last_reset,
            |state| {
                for credential in state.credentials.values_mut() {
                    credential.reset_daily();
                }
                info!(
                    previous = %state.last_reset,
                    today = %today,
                    keys = state.credentials.len(),
                    "daily quota reset applied"
                );
                state.last_reset = today;
            },
        );

        for credential in self.credentials.values_mut() {
            roll_forward_if(
                credential,
                |c| c.cooldown_elapsed(now),
                Credential::end_cooldown,
            );
            credential.window.prune(now);
        }
    }

    /// Best eligible key as of `now`. Assumes `roll_forward` already ran.
    pub(crate) fn best_eligible(&mut self, now: DateTime<Utc>) -> Option<&Credential> {
        let mut eligible = 0usize;
        let mut best: Option<((Reverse<u32>, u32, u64), String)> = None;
        for credential in self.credentials.values_mut() {
            if !credential.is_eligible(now) {
                continue;
            }
            eligible += 1;
            let rank = (
                Reverse(credential.daily_remaining()),
                credential.minute_count(now),
                credential.seq,
            );
            if best.as_ref().is_none_or(|(b, _)| rank < *b) {
                best = Some((rank, credential.id.clone()));
            }
        }
        metrics::gauge!("pool_keys_available").set(eligible as f64);

        let (_, id) = best?;
        self.credentials.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Result<&mut Credential> {
        self.credentials
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Credentials in insertion order.
    pub(crate) fn ordered_mut(&mut self) -> Vec<&mut Credential> {
        let mut all: Vec<&mut Credential> = self.credentials.values_mut().collect();
        all.sort_by_key(|c| c.seq);
        all
    }

    fn insert(
        &mut self,
        secret: Secret<String>,
        daily_limit: u32,
        minute_limit: u32,
    ) -> Result<String> {
        if secret.expose().trim().is_empty() {
            return Err(Error::InvalidInput("api_key must not be empty".into()));
        }
        if daily_limit == 0 || minute_limit == 0 {
            return Err(Error::InvalidInput(
                "rpd_limit and rpm_limit must be positive".into(),
            ));
        }
        if self
            .credentials
            .values()
            .any(|c| c.secret.expose() == secret.expose())
        {
            return Err(Error::AlreadyExists);
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let id = format!("key_{seq}");
        self.credentials.insert(
            id.clone(),
            Credential::new(id.clone(), seq, secret, daily_limit, minute_limit),
        );
        Ok(id)
    }
}

/// Pool of interchangeable API keys with daily and per-minute budgets.
pub struct Pool {
    state: Mutex<PoolState>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
}

impl Pool {
    /// Create a pool on the system clock from the configured seed keys.
    pub fn new(seeds: Vec<Secret<String>>, config: PoolConfig) -> Self {
        Self::with_clock(seeds, config, Arc::new(SystemClock))
    }

    /// Create a pool reading time from `clock`.
    ///
    /// Seeds get the default limits. Empty or duplicate seeds are skipped.
    pub fn with_clock(
        seeds: Vec<Secret<String>>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let mut state = PoolState {
            credentials: HashMap::new(),
            last_reset: calendar::civil_date(now, config.reset_zone),
            next_seq: 0,
        };
        for secret in seeds {
            let masked = secret.masked();
            if let Err(e) = state.insert(
                secret,
                config.default_daily_limit,
                config.default_minute_limit,
            ) {
                warn!(key = %masked, error = %e, "skipping seed key");
            }
        }
        info!(
            keys = state.credentials.len(),
            reset_zone = %config.reset_zone,
            "key pool initialized"
        );
        Self {
            state: Mutex::new(state),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current time as the pool sees it.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Take the lock and roll state forward to `now`.
    pub(crate) async fn lock_at(&self, now: DateTime<Utc>) -> MutexGuard<'_, PoolState> {
        let mut state = self.state.lock().await;
        state.roll_forward(now, self.config.reset_zone);
        state
    }

    pub(crate) fn unavailable(&self, now: DateTime<Utc>) -> Error {
        Error::Unavailable {
            next_reset: calendar::next_reset(now, self.config.reset_zone),
        }
    }

    /// Select the best eligible key without charging it.
    ///
    /// Returns `Unavailable` (with the next reset instant) if no key is active with
    /// both daily and per-minute budget left.
    pub async fn select(&self) -> Result<SelectedCredential> {
        let now = self.now();
        let mut state = self.lock_at(now).await;
        match state.best_eligible(now) {
            Some(credential) => {
                debug!(
                    key_id = %credential.id,
                    daily_remaining = credential.daily_remaining(),
                    "key selected"
                );
                Ok(SelectedCredential {
                    id: credential.id.clone(),
                    secret: credential.secret.clone(),
                })
            }
            None => {
                warn!(keys = state.credentials.len(), "no eligible key");
                Err(self.unavailable(now))
            }
        }
    }

    /// Charge one request to `id` at `at`.
    ///
    /// `NotFound` if the key was removed after selection; the in-flight request
    /// still completes, it just has nothing to charge.
    pub async fn record_usage(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock_at(self.now()).await;
        let credential = state.get_mut(id).inspect_err(|_| {
            warn!(key_id = id, "usage reported for a key no longer in the pool");
        })?;
        credential.charge(at);
        Ok(())
    }

    /// Clear the consecutive-failure streak of `id` after a successful request.
    pub async fn record_success(&self, id: &str) -> Result<()> {
        let mut state = self.lock_at(self.now()).await;
        state.get_mut(id)?.record_success();
        Ok(())
    }

    /// Apply an upstream failure to `id`.
    pub async fn record_failure(
        &self,
        id: &str,
        kind: FailureKind,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock_at(self.now()).await;
        let credential = state.get_mut(id).inspect_err(|_| {
            warn!(
                key_id = id,
                kind = kind.label(),
                "failure reported for a key no longer in the pool"
            );
        })?;
        credential.apply_failure(kind, at, &self.config.failure_policy());
        Ok(())
    }

    /// Admin override: zero every counter and restore non-disabled keys to active.
    pub async fn reset_all(&self) {
        let now = self.now();
        let mut state = self.state.lock().await;
        for credential in state.credentials.values_mut() {
            credential.reset_all();
        }
        state.last_reset = calendar::civil_date(now, self.config.reset_zone);
        info!(keys = state.credentials.len(), "all key counters reset by admin");
    }

    /// Add a key, filling omitted limits from the pool defaults. Returns its id.
    pub async fn add_credential(
        &self,
        secret: Secret<String>,
        daily_limit: Option<u32>,
        minute_limit: Option<u32>,
    ) -> Result<String> {
        let masked = secret.masked();
        let mut state = self.lock_at(self.now()).await;
        let id = state.insert(
            secret,
            daily_limit.unwrap_or(self.config.default_daily_limit),
            minute_limit.unwrap_or(self.config.default_minute_limit),
        )?;
        info!(key_id = %id, key = %masked, "key added to pool");
        Ok(id)
    }

    /// Remove a key. Requests already holding it finish, but it is never
    /// selected again.
    pub async fn remove_credential(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .credentials
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        info!(key_id = id, "key removed from pool");
        Ok(())
    }

    /// Take a key out of selection while keeping its record.
    pub async fn disable(&self, id: &str) -> Result<()> {
        let mut state = self.lock_at(self.now()).await;
        state.get_mut(id)?.status = CredentialStatus::Disabled;
        info!(key_id = id, "key disabled by admin");
        Ok(())
    }

    /// Return a disabled key to selection.
    pub async fn enable(&self, id: &str) -> Result<()> {
        let mut state = self.lock_at(self.now()).await;
        let credential = state.get_mut(id)?;
        if credential.status == CredentialStatus::Disabled {
            credential.status = if credential.daily_remaining() == 0 {
                CredentialStatus::Exhausted
            } else {
                CredentialStatus::Active
            };
            info!(key_id = id, status = credential.status.label(), "key enabled by admin");
        }
        Ok(())
    }

    /// Ids of all keys in insertion order.
    pub async fn key_ids(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.ordered_mut().into_iter().map(|c| c.id.clone()).collect()
    }
}
