//! Retry coordinator
//!
//! Pure state machine plus a driver. `step` receives events and returns
//! `(new_state, action)` without doing I/O; `Coordinator::run` executes each action
//! (pool calls, the upstream attempt, the inter-retry sleep) and feeds the result
//! back as the next event.
//!
//! Per inbound call:
//! 1. Selecting: ask the pool for the best key; none → Unavailable
//! 2. Attempting: charge the key, then dispatch through the forwarding layer
//! 3. Success → done. Rejection → record the failure on the key, wait if it was a
//!    per-minute throttle, and select again until the attempt bound is hit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pool::{Pool, SelectedCredential};
use crate::quota::FailureKind;

/// Bounds and delays for the retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum selection attempts per inbound call.
    pub max_attempts: u32,
    /// Wait after a per-minute rejection before selecting again.
    pub retry_delay: Duration,
    /// Cap on the wait when the upstream suggests a longer retry delay.
    pub max_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before re-selecting after a failure of `kind`.
    ///
    /// Only per-minute throttling waits: daily exhaustion and other failures move
    /// straight on to a different key.
    pub fn delay_for(&self, kind: FailureKind, retry_after: Option<Duration>) -> Duration {
        match kind {
            FailureKind::RateLimited => retry_after
                .map_or(self.retry_delay, |hint| hint.max(self.retry_delay))
                .min(self.max_retry_delay),
            FailureKind::DailyExhausted | FailureKind::Other => Duration::ZERO,
        }
    }
}

/// Normalized result of one upstream attempt, produced by the forwarding layer.
#[derive(Debug)]
pub enum Outcome<R> {
    /// Deliver `R` to the caller.
    Success(R),
    /// Quota rejection or upstream failure attributable to the key.
    Rejected {
        kind: FailureKind,
        /// Provider's suggested wait, if the response carried one.
        retry_after: Option<Duration>,
    },
}

impl<R> Outcome<R> {
    pub fn rejected(kind: FailureKind) -> Self {
        Outcome::Rejected {
            kind,
            retry_after: None,
        }
    }
}

/// How a coordinated call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Unavailable,
}

/// Coordinator states. `attempt` is 1-based and counts selections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    Selecting { attempt: u32 },
    Attempting { attempt: u32, key_id: String },
    /// A rejection was classified; recording it and waiting out any delay.
    BackingOff { attempt: u32 },
    Done(Completion),
}

impl RetryState {
    /// Initial state and action for a new inbound call.
    pub fn start() -> (RetryState, RetryAction) {
        (RetryState::Selecting { attempt: 1 }, RetryAction::Select)
    }
}

/// Events that drive coordinator transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    Selected { key_id: String },
    NoneAvailable,
    Succeeded,
    Failed {
        kind: FailureKind,
        retry_after: Option<Duration>,
    },
    /// Failure recorded and backoff (if any) elapsed.
    BackoffElapsed,
}

/// Actions the driver executes after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    Select,
    /// Charge the key, then send the request with it.
    Dispatch { key_id: String },
    /// Record the failure on the key, then sleep for `delay`.
    RecordFailure {
        key_id: String,
        kind: FailureKind,
        delay: Duration,
    },
    Finish(Completion),
    None,
}

/// Handle a coordinator transition. Pure function: no I/O.
pub fn step(
    state: RetryState,
    event: RetryEvent,
    policy: &RetryPolicy,
) -> (RetryState, RetryAction) {
    match (state, event) {
        // --- Selecting ---
        (RetryState::Selecting { attempt }, RetryEvent::Selected { key_id }) => (
            RetryState::Attempting {
                attempt,
                key_id: key_id.clone(),
            },
            RetryAction::Dispatch { key_id },
        ),

        (RetryState::Selecting { .. }, RetryEvent::NoneAvailable) => (
            RetryState::Done(Completion::Unavailable),
            RetryAction::Finish(Completion::Unavailable),
        ),

        // --- Attempting ---
        (RetryState::Attempting { .. }, RetryEvent::Succeeded) => (
            RetryState::Done(Completion::Success),
            RetryAction::Finish(Completion::Success),
        ),

        (
            RetryState::Attempting { attempt, key_id },
            RetryEvent::Failed { kind, retry_after },
        ) => (
            RetryState::BackingOff { attempt },
            RetryAction::RecordFailure {
                key_id,
                kind,
                delay: policy.delay_for(kind, retry_after),
            },
        ),

        // --- BackingOff ---
        (RetryState::BackingOff { attempt }, RetryEvent::BackoffElapsed)
            if attempt < policy.max_attempts =>
        {
            (
                RetryState::Selecting {
                    attempt: attempt + 1,
                },
                RetryAction::Select,
            )
        }

        (RetryState::BackingOff { .. }, RetryEvent::BackoffElapsed) => (
            RetryState::Done(Completion::Unavailable),
            RetryAction::Finish(Completion::Unavailable),
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, RetryAction::None),
    }
}

/// Runs inbound calls through the pool with failover.
#[derive(Clone)]
pub struct Coordinator {
    pool: Arc<Pool>,
    policy: RetryPolicy,
}

impl Coordinator {
    pub fn new(pool: Arc<Pool>, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive one inbound call to completion.
    ///
    /// `attempt` performs the upstream exchange with the given key and classifies the
    /// result. Usage is charged immediately before each attempt and is not refunded if
    /// the attempt fails or the caller goes away.
    ///
    /// Returns `Unavailable` if no key is eligible or the attempt bound is reached.
    pub async fn run<R, F, Fut>(&self, mut attempt: F) -> Result<R>
    where
        F: FnMut(SelectedCredential) -> Fut,
        Fut: Future<Output = Outcome<R>>,
    {
        let (mut state, mut action) = RetryState::start();
        let mut selected: Option<SelectedCredential> = None;
        let mut response: Option<R> = None;

        loop {
            let event = match action {
                RetryAction::Select => match self.pool.select().await {
                    Ok(credential) => {
                        let key_id = credential.id.clone();
                        selected = Some(credential);
                        RetryEvent::Selected { key_id }
                    }
                    Err(Error::Unavailable { .. }) => RetryEvent::NoneAvailable,
                    Err(e) => return Err(e),
                },

                RetryAction::Dispatch { key_id } => {
                    let Some(credential) = selected.take() else {
                        error!(key_id, "dispatch without a selected key");
                        return Err(self.pool.unavailable(self.pool.now()));
                    };
                    if self
                        .pool
                        .record_usage(&key_id, self.pool.now())
                        .await
                        .is_err()
                    {
                        // Removed between selection and dispatch; finish the call anyway.
                        debug!(key_id, "dispatching with a key removed after selection");
                    }
                    match attempt(credential).await {
                        Outcome::Success(r) => {
                            // Removed mid-flight is already logged by record_usage.
                            let _ = self.pool.record_success(&key_id).await;
                            response = Some(r);
                            RetryEvent::Succeeded
                        }
                        Outcome::Rejected { kind, retry_after } => {
                            RetryEvent::Failed { kind, retry_after }
                        }
                    }
                }

                RetryAction::RecordFailure {
                    key_id,
                    kind,
                    delay,
                } => {
                    metrics::counter!("pool_failovers_total", "reason" => kind.label())
                        .increment(1);
                    warn!(
                        key_id,
                        reason = kind.label(),
                        delay_ms = delay.as_millis() as u64,
                        "upstream rejected key, retrying"
                    );
                    // NotFound here is the remove-while-in-flight race, already logged.
                    let _ = self
                        .pool
                        .record_failure(&key_id, kind, self.pool.now())
                        .await;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    RetryEvent::BackoffElapsed
                }

                RetryAction::Finish(Completion::Success) => {
                    return response.ok_or_else(|| self.pool.unavailable(self.pool.now()));
                }

                RetryAction::Finish(Completion::Unavailable) => {
                    metrics::counter!("pool_unavailable_total").increment(1);
                    let err = self.pool.unavailable(self.pool.now());
                    info!(error = %err, "no key could serve the request");
                    return Err(err);
                }

                RetryAction::None => {
                    error!(?state, "retry state machine stalled");
                    return Err(self.pool.unavailable(self.pool.now()));
                }
            };

            (state, action) = step(state, event, &self.policy);
        }
    }
}
