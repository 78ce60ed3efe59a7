//! HTTP forwarding layer
//!
//! Receives inbound requests, strips hop-by-hop headers and any caller-supplied
//! API key, and forwards to the upstream with a pooled key in `x-goog-api-key`.
//! Key selection, charging and failover are driven by the retry coordinator; this
//! module only performs one upstream exchange per attempt and reports a normalized
//! outcome. Responses that are not retried (any status other than 429/5xx) are
//! streamed back unchanged, which covers `alt=sse` streaming.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use key_pool::{Coordinator, FailureKind, Outcome, SelectedCredential};
use tracing::{debug, error, instrument, warn};

use crate::error::{ApiError, json_response};
use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers the proxy sets itself.
const REPLACED_REQUEST_HEADERS: &[&str] = &["host", "content-length", API_KEY_HEADER];

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Query parameter callers may use to pass their own key.
const API_KEY_PARAM: &str = "key";

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub max_body_bytes: usize,
    pub coordinator: Coordinator,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Decrements the in-flight counter when the request finishes, however it ends.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    json_response(
        status,
        serde_json::json!({
            "error": {
                "type": "proxy_error",
                "message": message,
                "request_id": request_id,
            }
        }),
    )
}

/// One inbound request, prepared for forwarding with any key.
struct Forward<'a> {
    state: &'a ProxyState,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
}

impl Forward<'_> {
    /// Send once with `credential` and classify the upstream's answer.
    async fn attempt(&self, credential: SelectedCredential) -> Outcome<reqwest::Response> {
        let mut key = match HeaderValue::from_str(credential.secret.expose()) {
            Ok(v) => v,
            Err(_) => {
                error!(key_id = %credential.id, "key is not a valid header value");
                return Outcome::rejected(FailureKind::Other);
            }
        };
        key.set_sensitive(true);

        let mut headers = self.headers.clone();
        headers.insert(HeaderName::from_static(API_KEY_HEADER), key);

        debug!(key_id = %credential.id, url = %self.url, "forwarding to upstream");
        // Bounded until response headers only; streamed bodies may run longer.
        let sent = tokio::time::timeout(
            self.state.timeout,
            self.state
                .client
                .request(self.method.clone(), &self.url)
                .headers(headers)
                .body(self.body.clone())
                .send(),
        )
        .await;

        let upstream = match sent {
            Ok(Ok(r)) => r,
            Err(_) => {
                metrics::record_upstream_error("timeout");
                warn!(
                    key_id = %credential.id,
                    timeout_secs = self.state.timeout.as_secs(),
                    "upstream did not respond in time"
                );
                return Outcome::rejected(FailureKind::Other);
            }
            Ok(Err(e)) => {
                let error_type = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection"
                } else {
                    "request"
                };
                metrics::record_upstream_error(error_type);
                warn!(key_id = %credential.id, error = %e, "upstream request failed");
                return Outcome::rejected(FailureKind::Other);
            }
        };

        let status = upstream.status();
        if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
            return Outcome::Success(upstream);
        }

        // Error bodies are small; read them to tell daily from per-minute quota.
        let body = match tokio::time::timeout(self.state.timeout, upstream.text()).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };
        let kind =
            key_pool::classify_status(status.as_u16(), &body).unwrap_or(FailureKind::Other);
        metrics::record_upstream_error(kind.label());
        debug!(
            key_id = %credential.id,
            status = status.as_u16(),
            reason = kind.label(),
            "upstream rejected request"
        );
        Outcome::Rejected {
            kind,
            retry_after: key_pool::retry_after(&body),
        }
    }
}

/// Proxy an inbound request upstream through the key pool.
#[instrument(
    skip_all,
    fields(request_id = %request_id, method = %request.method(), path = %request.uri().path())
)]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::enter(&state.in_flight);

    let method = request.method().clone();
    let url = upstream_url(&state.upstream_url, request.uri());
    let headers = forward_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), state.max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            let response = error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                &request_id,
            );
            metrics::record_request(
                response.status().as_u16(),
                method.as_str(),
                started.elapsed().as_secs_f64(),
            );
            return response;
        }
    };

    let forward = Forward {
        state,
        method: method.clone(),
        url,
        headers,
        body,
    };

    let response = match state
        .coordinator
        .run(|credential| forward.attempt(credential))
        .await
    {
        Ok(upstream) => stream_response(upstream, &request_id),
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            ApiError(e).into_response()
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Pass the upstream response through, streaming the body.
fn stream_response(upstream: reqwest::Response, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Upstream URL for `uri`, with any `key` query parameter removed.
pub fn upstream_url(base: &str, uri: &Uri) -> String {
    let mut url = format!("{}{}", base.trim_end_matches('/'), uri.path());
    if let Some(query) = uri.query() {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split('=').next() != Some(API_KEY_PARAM))
            .collect();
        if !kept.is_empty() {
            url.push('?');
            url.push_str(&kept.join("&"));
        }
    }
    url
}

/// Inbound headers minus hop-by-hop and proxy-managed ones.
pub fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || REPLACED_REQUEST_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name_str))
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
