//! Allocation protocol for clients that call the upstream directly
//!
//! SDK clients that cannot route through the proxy borrow a real key, use it
//! themselves, and report back. The pool never sees the HTTP exchange, so the key
//! is charged at allocation time rather than at dispatch time as on the proxy path.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::pool::Pool;
use crate::quota::FailureKind;

/// A key handed out to a direct caller.
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub key_id: String,
    pub api_key: String,
}

impl Pool {
    /// Select and charge a key in one critical section.
    pub async fn allocate(&self) -> Result<Allocation> {
        let now = self.now();
        let mut state = self.lock_at(now).await;
        let id = match state.best_eligible(now) {
            Some(credential) => credential.id().to_string(),
            None => return Err(self.unavailable(now)),
        };
        let credential = state.get_mut(&id)?;
        credential.charge(now);
        info!(key_id = %id, "key allocated to direct caller");
        Ok(Allocation {
            key_id: id,
            api_key: credential.secret.expose().clone(),
        })
    }

    /// Confirmation of a completed call. Usage was already charged at allocation;
    /// only the failure streak is cleared.
    pub async fn report_usage(&self, id: &str) -> Result<()> {
        self.record_success(id).await?;
        debug!(key_id = id, "direct caller reported usage");
        Ok(())
    }

    /// Failure reported by a direct caller, who did the classification.
    pub async fn report_error(&self, id: &str, is_daily_limit: bool) -> Result<()> {
        let kind = if is_daily_limit {
            FailureKind::DailyExhausted
        } else {
            FailureKind::Other
        };
        self.record_failure(id, kind, self.now()).await
    }
}
