//! Error types for pool operations

use chrono::{DateTime, Utc};

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No eligible credential. Retryable once quotas drain or reset.
    #[error("all API keys exhausted, next reset at {}", next_reset.to_rfc3339())]
    Unavailable { next_reset: DateTime<Utc> },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("API key already exists")]
    AlreadyExists,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
