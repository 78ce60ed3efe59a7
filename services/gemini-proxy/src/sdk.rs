//! Allocation endpoints for clients that call the upstream directly
//!
//! SDK clients that cannot be pointed at a proxy borrow a real key, use it, and
//! report back. The key is charged when it is handed out.
//!
//! Endpoints:
//! - POST /sdk/allocate-key: hand out the best available key
//! - POST /sdk/report-usage: acknowledge a completed call
//! - POST /sdk/report-error: report a failure, `is_rpd_limit` marks the key exhausted

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::post;
use key_pool::Pool;
use serde::Deserialize;

use crate::error::{ApiError, json_response};

/// Build the allocation router.
pub fn build_sdk_router(pool: Arc<Pool>) -> Router {
    Router::new()
        .route("/sdk/allocate-key", post(allocate_key))
        .route("/sdk/report-usage", post(report_usage))
        .route("/sdk/report-error", post(report_error))
        .with_state(pool)
}

#[derive(Deserialize)]
struct UsageReport {
    key_id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorReport {
    key_id: Option<String>,
    #[serde(default)]
    is_rpd_limit: bool,
}

fn require_key_id(key_id: Option<String>) -> Result<String, ApiError> {
    key_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| key_pool::Error::InvalidInput("key_id is required".into()).into())
}

/// POST /sdk/allocate-key: returns the real key; 503 with Retry-After when none is left.
async fn allocate_key(State(pool): State<Arc<Pool>>) -> Result<Response, ApiError> {
    let allocation = pool.allocate().await?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({
            "key_id": allocation.key_id,
            "api_key": allocation.api_key,
        }),
    ))
}

/// POST /sdk/report-usage: body `{"key_id": "key_1"}`.
async fn report_usage(
    State(pool): State<Arc<Pool>>,
    axum::Json(body): axum::Json<UsageReport>,
) -> Result<Response, ApiError> {
    let key_id = require_key_id(body.key_id)?;
    pool.report_usage(&key_id).await?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "status": "recorded" }),
    ))
}

/// POST /sdk/report-error: body `{"key_id": "key_1", "is_rpd_limit": false}`.
async fn report_error(
    State(pool): State<Arc<Pool>>,
    axum::Json(body): axum::Json<ErrorReport>,
) -> Result<Response, ApiError> {
    let key_id = require_key_id(body.key_id)?;
    pool.report_error(&key_id, body.is_rpd_limit).await?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "status": "recorded" }),
    ))
}
