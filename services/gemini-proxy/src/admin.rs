//! Admin API for key management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) so it is never exposed
//! alongside the forwarding port. Secrets are only ever returned masked.
//!
//! Endpoints:
//! - GET    /admin/status: aggregate counts plus every key
//! - GET    /admin/status/{id}: one key
//! - POST   /admin/reset: zero all counters
//! - POST   /admin/keys: add a key, returns its id
//! - DELETE /admin/keys/{id}: remove a key
//! - POST   /admin/keys/{id}/disable: take a key out of rotation
//! - POST   /admin/keys/{id}/enable: put it back

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use common::Secret;
use key_pool::Pool;
use serde::Deserialize;

use crate::error::{ApiError, json_response};

/// Build the admin axum router with all key management endpoints.
pub fn build_admin_router(pool: Arc<Pool>) -> Router {
    Router::new()
        .route("/admin/status", get(pool_status))
        .route("/admin/status/{id}", get(key_status))
        .route("/admin/reset", post(reset_counters))
        .route("/admin/keys", post(add_key))
        .route("/admin/keys/{id}", delete(remove_key))
        .route("/admin/keys/{id}/disable", post(disable_key))
        .route("/admin/keys/{id}/enable", post(enable_key))
        .with_state(pool)
}

/// GET /admin/status
async fn pool_status(State(pool): State<Arc<Pool>>) -> Response {
    axum::Json(pool.status().await).into_response()
}

/// GET /admin/status/{id}
async fn key_status(
    State(pool): State<Arc<Pool>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(axum::Json(pool.status_one(&id).await?).into_response())
}

/// POST /admin/reset: manual override of the daily reset. Disabled keys stay disabled.
async fn reset_counters(State(pool): State<Arc<Pool>>) -> Response {
    pool.reset_all().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({ "message": "Counters reset successfully" }),
    )
}

/// Request body for add-key. Limits are signed so that non-positive values get a
/// 400 with a useful message instead of a deserialization error.
#[derive(Deserialize)]
struct AddKeyRequest {
    api_key: Option<String>,
    rpd_limit: Option<i64>,
    rpm_limit: Option<i64>,
}

fn positive_limit(name: &str, value: Option<i64>) -> Result<Option<u32>, ApiError> {
    match value {
        None => Ok(None),
        Some(v) if v > 0 => u32::try_from(v).map(Some).map_err(|_| {
            key_pool::Error::InvalidInput(format!("{name} is too large")).into()
        }),
        Some(_) => Err(
            key_pool::Error::InvalidInput(format!("{name} must be a positive integer")).into(),
        ),
    }
}

/// POST /admin/keys: `{"api_key": "...", "rpd_limit"?: n, "rpm_limit"?: n}` → 201 `{"key_id"}`.
async fn add_key(
    State(pool): State<Arc<Pool>>,
    axum::Json(body): axum::Json<AddKeyRequest>,
) -> Result<Response, ApiError> {
    let api_key = body
        .api_key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| key_pool::Error::InvalidInput("api_key is required".into()))?;
    let rpd_limit = positive_limit("rpd_limit", body.rpd_limit)?;
    let rpm_limit = positive_limit("rpm_limit", body.rpm_limit)?;

    let key_id = pool
        .add_credential(Secret::new(api_key.trim().to_owned()), rpd_limit, rpm_limit)
        .await?;

    Ok(json_response(
        StatusCode::CREATED,
        serde_json::json!({ "key_id": key_id }),
    ))
}

/// DELETE /admin/keys/{id}: 204 on success.
async fn remove_key(
    State(pool): State<Arc<Pool>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    pool.remove_credential(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/keys/{id}/disable
async fn disable_key(
    State(pool): State<Arc<Pool>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    pool.disable(&id).await?;
    key_state(&pool, id).await
}

/// POST /admin/keys/{id}/enable: the key comes back exhausted if its daily budget is spent.
async fn enable_key(
    State(pool): State<Arc<Pool>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    pool.enable(&id).await?;
    key_state(&pool, id).await
}

async fn key_state(pool: &Pool, id: String) -> Result<Response, ApiError> {
    let view = pool.status_one(&id).await?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "key_id": id, "status": view.status }),
    ))
}
