//! Pool of interchangeable Gemini API keys
//!
//! Tracks a daily (RPD) and per-minute (RPM) budget for each key, selects the key
//! with the most daily budget left, and coordinates failover when the upstream
//! rejects a key. Daily budgets reset lazily at midnight in the provider's civil
//! timezone (Pacific by default); the per-minute budget is a sliding 60-second
//! window.
//!
//! Key lifecycle:
//! 1. Key loaded from config or added via admin API → status `Active`
//! 2. Coordinator selects the best key, charges it, and dispatches upstream
//! 3. Daily budget used up, or upstream 429 mentions a daily quota → `Exhausted`
//! 4. Repeated non-quota failures → `Cooldown` for a fixed duration
//! 5. First access after midnight Pacific → every `Exhausted` key back to `Active`
//! 6. Admin disables a key → `Disabled` until explicitly enabled

pub mod allocation;
pub mod calendar;
pub mod credential;
pub mod error;
pub mod pool;
pub mod quota;
pub mod retry;
pub mod status;
pub mod window;

pub use allocation::Allocation;
pub use calendar::{Clock, ManualClock, SystemClock};
pub use credential::CredentialStatus;
pub use error::{Error, Result};
pub use pool::{Pool, PoolConfig, SelectedCredential};
pub use quota::{FailureKind, classify_429, classify_status, retry_after};
pub use retry::{Coordinator, Outcome, RetryPolicy};
pub use status::{CredentialView, PoolStatus};
