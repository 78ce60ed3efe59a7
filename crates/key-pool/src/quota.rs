//! Quota detection for Gemini API responses
//!
//! Distinguishes between per-minute throttling (429 that drains within the minute
//! window) and daily quota exhaustion (429 that lasts until the Pacific midnight
//! reset). Only daily exhaustion takes a key out of rotation for the day.

use std::time::Duration;

use serde_json::Value;

/// Normalized failure outcome reported by the forwarding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Requests-per-day budget spent; key unusable until the daily reset.
    DailyExhausted,
    /// Requests-per-minute throttle; clears as the minute window drains.
    RateLimited,
    /// Network error or upstream 5xx.
    Other,
}

impl FailureKind {
    /// Label for metrics and logging.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::DailyExhausted => "daily_exhausted",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Other => "other",
        }
    }
}

/// Phrases in a 429 error message that indicate the daily budget.
const DAILY_MESSAGE_PATTERNS: &[&str] = &["per day", "daily"];

/// Fragments of `QuotaFailure` quota ids/metrics that indicate the daily budget.
const DAILY_QUOTA_ID_PATTERNS: &[&str] = &["perday", "per_day"];

/// Classify a 429 response body as daily exhaustion or per-minute throttling.
///
/// Checks the `error.message` for daily phrasing and any `QuotaFailure` violation's
/// `quotaId`/`quotaMetric` in `error.details`. Unparsable or unrecognized bodies are
/// treated as per-minute throttling.
pub fn classify_429(body: &str) -> FailureKind {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return FailureKind::RateLimited;
    };
    let Some(error) = json.get("error") else {
        return FailureKind::RateLimited;
    };

    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    if DAILY_MESSAGE_PATTERNS.iter().any(|p| message.contains(p)) {
        return FailureKind::DailyExhausted;
    }

    let violations = error
        .get("details")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|detail| detail.get("violations").and_then(Value::as_array))
        .flatten();
    for violation in violations {
        for field in ["quotaId", "quotaMetric"] {
            let value = violation
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            if DAILY_QUOTA_ID_PATTERNS.iter().any(|p| value.contains(p)) {
                return FailureKind::DailyExhausted;
            }
        }
    }

    FailureKind::RateLimited
}

/// Classify an upstream response by HTTP status and body.
///
/// Returns `None` when the response should be delivered to the caller as-is
/// (2xx, and 4xx other than 429, which are the caller's problem, not the key's).
pub fn classify_status(status: u16, body: &str) -> Option<FailureKind> {
    match status {
        429 => Some(classify_429(body)),
        500..=599 => Some(FailureKind::Other),
        _ => None,
    }
}

/// Extract the `RetryInfo.retryDelay` hint (e.g. `"17s"`, `"1.5s"`) from a 429 body.
pub fn retry_after(body: &str) -> Option<Duration> {
    let json = serde_json::from_str::<Value>(body).ok()?;
    json.get("error")?
        .get("details")?
        .as_array()?
        .iter()
        .filter_map(|detail| detail.get("retryDelay").and_then(Value::as_str))
        .find_map(parse_delay)
}

fn parse_delay(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().strip_suffix('s')?.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
