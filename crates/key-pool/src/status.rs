//! Administrative views of the pool
//!
//! Views are computed under the pool lock after rolling state forward, so the
//! remaining budget and minute counts are never stale. Secrets only ever appear
//! masked.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::calendar;
use crate::credential::{Credential, CredentialStatus};
use crate::error::Result;
use crate::pool::Pool;

/// Per-key view for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: String,
    pub key_prefix: String,
    pub status: &'static str,
    pub rpd_limit: u32,
    pub rpd_used: u32,
    pub rpd_remaining: u32,
    pub rpm_limit: u32,
    pub rpm_current: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl CredentialView {
    fn capture(credential: &mut Credential, now: DateTime<Utc>) -> Self {
        let cooldown_until = match credential.status {
            CredentialStatus::Cooldown { until } => Some(until),
            _ => None,
        };
        Self {
            id: credential.id.clone(),
            key_prefix: credential.secret.masked(),
            status: credential.status.label(),
            rpd_limit: credential.daily_limit,
            rpd_used: credential.daily_used,
            rpd_remaining: credential.daily_remaining(),
            rpm_limit: credential.minute_limit,
            rpm_current: credential.minute_count(now),
            last_used: credential.last_used,
            last_error: credential.last_error,
            consecutive_failures: credential.consecutive_failures,
            cooldown_until,
        }
    }
}

/// Aggregate pool view.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// "healthy" (every key available), "degraded" (some) or "unhealthy" (none).
    pub status: &'static str,
    pub total_keys: usize,
    pub available_keys: usize,
    pub exhausted_keys: usize,
    pub cooldown_keys: usize,
    pub disabled_keys: usize,
    pub next_reset: DateTime<Utc>,
    pub keys: Vec<CredentialView>,
}

impl Pool {
    /// Snapshot of every key plus aggregate counts.
    pub async fn status(&self) -> PoolStatus {
        let now = self.now();
        let mut state = self.lock_at(now).await;

        let mut available = 0usize;
        let mut exhausted = 0usize;
        let mut cooldown = 0usize;
        let mut disabled = 0usize;
        let mut keys = Vec::with_capacity(state.credentials.len());

        for credential in state.ordered_mut() {
            if credential.is_eligible(now) {
                available += 1;
            }
            match credential.status {
                CredentialStatus::Exhausted => exhausted += 1,
                CredentialStatus::Cooldown { .. } => cooldown += 1,
                CredentialStatus::Disabled => disabled += 1,
                CredentialStatus::Active => {}
            }
            keys.push(CredentialView::capture(credential, now));
        }

        let total = keys.len();
        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        PoolStatus {
            status,
            total_keys: total,
            available_keys: available,
            exhausted_keys: exhausted,
            cooldown_keys: cooldown,
            disabled_keys: disabled,
            next_reset: calendar::next_reset(now, self.config().reset_zone),
            keys,
        }
    }

    /// View of a single key; `NotFound` if absent.
    pub async fn status_one(&self, id: &str) -> Result<CredentialView> {
        let now = self.now();
        let mut state = self.lock_at(now).await;
        let credential = state.get_mut(id)?;
        Ok(CredentialView::capture(credential, now))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use common::Secret;

    use crate::calendar::{Clock, ManualClock};
    use crate::error::Error;
    use crate::pool::PoolConfig;
    use crate::quota::FailureKind;

    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn test_pool(keys: &[&str]) -> (Pool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(utc("2026-07-15T19:00:00Z")));
        let seeds = keys.iter().map(|k| Secret::new(k.to_string())).collect();
        (
            Pool::with_clock(seeds, PoolConfig::default(), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn status_counts_and_masks() {
        let (pool, clock) = test_pool(&["AIzaSyFirstKey000001", "AIzaSySecondKey00002"]);
        pool.record_failure("key_2", FailureKind::DailyExhausted, clock.now())
            .await
            .unwrap();

        let status = pool.status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.total_keys, 2);
        assert_eq!(status.available_keys, 1);
        assert_eq!(status.exhausted_keys, 1);
        // Summer: Pacific midnight is 07:00 UTC
        assert_eq!(status.next_reset, utc("2026-07-16T07:00:00Z"));

        assert_eq!(status.keys[0].id, "key_1");
        assert_eq!(status.keys[0].key_prefix, "AIzaSyFi...001");
        assert_eq!(status.keys[1].status, "exhausted");
        assert_eq!(status.keys[1].rpd_remaining, 0);

        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("AIzaSyFirstKey000001"));
        assert!(!json.contains("AIzaSySecondKey00002"));
    }

    #[tokio::test]
    async fn status_recomputes_minute_count_from_pruned_window() {
        let (pool, clock) = test_pool(&["AIzaSyFirstKey000001"]);
        for _ in 0..4 {
            pool.record_usage("key_1", clock.now()).await.unwrap();
        }
        assert_eq!(pool.status_one("key_1").await.unwrap().rpm_current, 4);

        clock.advance(Duration::seconds(61));
        let view = pool.status_one("key_1").await.unwrap();
        assert_eq!(view.rpm_current, 0);
        assert_eq!(view.rpd_used, 4);
        assert_eq!(view.rpd_remaining, 246);
    }

    #[tokio::test]
    async fn add_then_status_one_reflects_limits() {
        let (pool, _clock) = test_pool(&[]);
        let id = pool
            .add_credential(Secret::new("AIzaSyAddedKey000001".into()), Some(500), Some(15))
            .await
            .unwrap();

        let view = pool.status_one(&id).await.unwrap();
        assert_eq!(view.rpd_limit, 500);
        assert_eq!(view.rpm_limit, 15);
        assert_eq!(view.rpd_used, 0);
        assert_eq!(view.rpm_current, 0);
        assert_eq!(view.status, "active");

        pool.remove_credential(&id).await.unwrap();
        assert!(matches!(
            pool.status_one(&id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cooldown_view_exposes_until() {
        let (pool, clock) = test_pool(&["AIzaSyFirstKey000001"]);
        for _ in 0..3 {
            pool.record_failure("key_1", FailureKind::Other, clock.now())
                .await
                .unwrap();
        }
        let status = pool.status().await;
        assert_eq!(status.status, "unhealthy");
        assert_eq!(status.cooldown_keys, 1);
        assert_eq!(
            status.keys[0].cooldown_until,
            Some(clock.now() + Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn empty_pool_is_unhealthy() {
        let (pool, _clock) = test_pool(&[]);
        let status = pool.status().await;
        assert_eq!(status.status, "unhealthy");
        assert_eq!(status.total_keys, 0);
    }

    #[tokio::test]
    async fn disabled_keys_are_counted() {
        let (pool, _clock) = test_pool(&["AIzaSyFirstKey000001", "AIzaSySecondKey00002"]);
        pool.disable("key_1").await.unwrap();
        let status = pool.status().await;
        assert_eq!(status.disabled_keys, 1);
        assert_eq!(status.available_keys, 1);
        assert_eq!(status.keys[0].status, "disabled");
    }
}
