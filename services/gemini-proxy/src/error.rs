//! HTTP mapping for pool errors
//!
//! Per-request failures never propagate as Rust errors past the handlers: each
//! `key_pool::Error` turns into a JSON response with a fixed status code.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

/// Seconds a caller should wait after an unavailable response.
pub const RETRY_AFTER_SECS: u64 = 60;

/// JSON response with the given status.
pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Pool error rendered for HTTP callers.
#[derive(Debug)]
pub struct ApiError(pub key_pool::Error);

impl From<key_pool::Error> for ApiError {
    fn from(err: key_pool::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            // Same envelope the upstream uses, so SDKs parse it as a normal API error.
            key_pool::Error::Unavailable { next_reset } => {
                let mut response = json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({
                        "error": {
                            "code": 503,
                            "message": "All API keys exhausted",
                            "status": "UNAVAILABLE",
                            "next_reset": next_reset.to_rfc3339(),
                        }
                    }),
                );
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
                response
            }
            err @ key_pool::Error::NotFound(_) => json_response(
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": err.to_string() }),
            ),
            err @ key_pool::Error::InvalidInput(_) => json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": err.to_string() }),
            ),
            err @ key_pool::Error::AlreadyExists => json_response(
                StatusCode::CONFLICT,
                serde_json::json!({ "error": err.to_string() }),
            ),
        }
    }
}
