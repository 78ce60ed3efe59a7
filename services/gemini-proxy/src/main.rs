//! Gemini API Key Pool Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Gemini API keys with daily and per-minute budgets
//! 2. Proxies requests to generativelanguage.googleapis.com, injecting the key
//!    with the most daily budget left and failing over on quota rejections
//! 3. Hands out keys to SDK clients that call the upstream directly (`/sdk/*`)
//! 4. Serves the admin API on a separate listener (`/admin/*`)

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;
mod sdk;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use key_pool::{Coordinator, Pool};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::proxy::ProxyState;

/// Time allowed for in-flight requests to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on establishing an upstream connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    pool: Arc<Pool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public router: health, metrics, allocation endpoints and the
/// catch-all forwarder, under a concurrency limit of `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let sdk = sdk::build_sdk_router(state.pool.clone());
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .merge(sdk)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-key-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    // Without an explicit --config, a missing file means env-only configuration
    let config = if cli_config_path.is_none() && !config_path.exists() {
        info!("no config file found, using defaults and environment");
        Config::from_toml("")
    } else {
        Config::load(&config_path)
    }
    .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        admin_listen_addr = %config.admin.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        keys = config.api_keys.len(),
        default_rpd_limit = config.pool.default_daily_limit,
        default_rpm_limit = config.pool.default_minute_limit,
        reset_timezone = %config.pool.reset_timezone,
        "configuration loaded"
    );

    let pool_config = config.pool_config().context("invalid pool configuration")?;
    let pool = Arc::new(Pool::new(config.api_keys.clone(), pool_config));
    let coordinator = Coordinator::new(pool.clone(), config.retry_policy());

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build upstream HTTP client")?;

    let proxy_state = ProxyState {
        client,
        upstream_url: config.proxy.upstream_url.clone(),
        timeout: Duration::from_secs(config.proxy.timeout_secs),
        max_body_bytes: config.proxy.max_body_bytes,
        coordinator,
        requests_total: Arc::new(AtomicU64::new(0)),
        errors_total: Arc::new(AtomicU64::new(0)),
        in_flight: Arc::new(AtomicU64::new(0)),
    };
    let in_flight = proxy_state.in_flight.clone();

    let app_state = AppState {
        proxy: proxy_state,
        pool: pool.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.proxy.max_connections);
    let admin_app = admin::build_admin_router(pool);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    let admin_addr = config.admin.listen_addr;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;

    info!(addr = %listen_addr, admin_addr = %admin_addr, "accepting requests");

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. both servers stop accepting new connections and drain in-flight requests
    // 3. DRAIN_TIMEOUT, started at signal receipt, bounds how long that may take
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());

    let server_handle = tokio::spawn(serve(listener, app, shutdown_rx.clone()));
    let admin_handle = tokio::spawn(serve(admin_listener, admin_app, shutdown_rx));

    shutdown_signal().await;

    // Signal both servers to begin draining
    let _ = shutdown_tx.send(());

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        tokio::join!(server_handle, admin_handle)
    })
    .await;

    match drained {
        Ok((proxy_result, admin_result)) => {
            for (name, result) in [("proxy", proxy_result), ("admin", admin_result)] {
                match result {
                    Ok(Ok(())) => info!(server = name, "all in-flight requests drained"),
                    Ok(Err(e)) => error!(server = name, error = %e, "server error during shutdown"),
                    Err(e) => error!(server = name, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Run `app` on `listener` until the shutdown channel fires.
async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

/// GET /: service banner with key availability.
async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.pool.status().await;
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "service": "Gemini API Key Pool Proxy",
            "status": "running",
            "keys_available": status.available_keys,
            "total_keys": status.total_keys,
        })
        .to_string(),
    )
}

/// Health endpoint: always 200 while the process serves; `pool_status` reports
/// whether any key can currently take a request.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.pool.status().await;
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state.proxy.requests_total.load(Ordering::Relaxed);
    let errors = state.proxy.errors_total.load(Ordering::Relaxed);

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "status": "healthy",
            "pool_status": status.status,
            "keys_available": status.available_keys,
            "total_keys": status.total_keys,
            "next_reset": status.next_reset.to_rfc3339(),
            "uptime_seconds": uptime,
            "requests_served": requests,
            "errors_total": errors,
        })
        .to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies everything else to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use common::Secret;
    use key_pool::{PoolConfig, RetryPolicy};
    use std::sync::atomic::AtomicU32;
    use tower::ServiceExt;

    /// Upstream answers every request made with this key with a daily-quota 429.
    const DAILY_DONE_KEY: &str = "AIzaSyDailyDoneKey001";
    /// Upstream answers every request made with this key with a per-minute 429.
    const THROTTLED_KEY: &str = "AIzaSyThrottledKey001";
    const WORKING_KEY: &str = "AIzaSyWorkingKey00001";
    const SPARE_KEY: &str = "AIzaSySpareKey0000001";

    const DAILY_429: &str = r#"{"error":{"code":429,"message":"Quota exceeded for quota metric 'Generate Content API requests per day' and limit 'GenerateContent request limit per day'","status":"RESOURCE_EXHAUSTED"}}"#;
    const MINUTE_429: &str = r#"{"error":{"code":429,"message":"Resource has been exhausted (e.g. check quota).","status":"RESOURCE_EXHAUSTED"}}"#;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// Build test app state pointing at the given upstream URL with the given keys.
    fn test_app_state(upstream_url: &str, keys: &[&str]) -> AppState {
        let seeds = keys.iter().map(|k| Secret::new(k.to_string())).collect();
        let pool = Arc::new(Pool::new(seeds, PoolConfig::default()));
        let policy = RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(10),
        };

        AppState {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                upstream_url: upstream_url.to_string(),
                timeout: Duration::from_secs(5),
                max_body_bytes: 1024 * 1024,
                coordinator: Coordinator::new(pool.clone(), policy),
                requests_total: Arc::new(AtomicU64::new(0)),
                errors_total: Arc::new(AtomicU64::new(0)),
                in_flight: Arc::new(AtomicU64::new(0)),
            },
            pool,
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        }
    }

    /// Start a mock Gemini upstream. Behaviour is keyed on the injected API key;
    /// otherwise it echoes the request back as JSON. Returns the URL and a hit counter.
    async fn start_mock_upstream() -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            let app = axum::Router::new().fallback(move |request: Request<Body>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let key = request
                        .headers()
                        .get("x-goog-api-key")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let path = request.uri().path().to_string();
                    let query = request.uri().query().unwrap_or("").to_string();

                    if key == DAILY_DONE_KEY {
                        return (StatusCode::TOO_MANY_REQUESTS, DAILY_429).into_response();
                    }
                    if key == THROTTLED_KEY {
                        return (StatusCode::TOO_MANY_REQUESTS, MINUTE_429).into_response();
                    }
                    if path.ends_with("/broken") {
                        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
                    }
                    if path.ends_with("/invalid") {
                        return (
                            StatusCode::BAD_REQUEST,
                            r#"{"error":{"code":400,"status":"INVALID_ARGUMENT"}}"#,
                        )
                            .into_response();
                    }
                    if path.ends_with(":streamGenerateContent") {
                        return (
                            StatusCode::OK,
                            [(header::CONTENT_TYPE, "text/event-stream")],
                            "data: {\"n\":1}\n\ndata: {\"n\":2}\n\n",
                        )
                            .into_response();
                    }

                    let mut headers_map = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers_map.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let method = request.method().to_string();
                    let body_bytes = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                        .await
                        .unwrap();
                    axum::Json(serde_json::json!({
                        "key": key,
                        "echoed_headers": headers_map,
                        "method": method,
                        "path": path,
                        "query": query,
                        "body": String::from_utf8_lossy(&body_bytes),
                    }))
                    .into_response()
                }
            });
            axum::serve(listener, app).await.unwrap();
        });

        (url, hits)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn generate(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"contents":[{"parts":[{"text":"hi"}]}]}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let state = test_app_state("http://unused", &[WORKING_KEY, SPARE_KEY]);
        state.proxy.requests_total.fetch_add(5, Ordering::Relaxed);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["pool_status"], "healthy");
        assert_eq!(json["keys_available"], 2);
        assert_eq!(json["total_keys"], 2);
        assert_eq!(json["requests_served"], 5);
    }

    #[tokio::test]
    async fn root_reports_service_and_keys() {
        let state = test_app_state("http://unused", &[WORKING_KEY]);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "running");
        assert_eq!(json["keys_available"], 1);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let state = test_app_state("http://unused", &[WORKING_KEY]);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn proxy_injects_pool_key_and_strips_caller_key() {
        let (upstream_url, _hits) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, &[WORKING_KEY]);
        let pool = state.pool.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1beta/models/gemini-2.0-flash:generateContent?key=AIzaCallerOwn&alt=json")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("x-goog-api-key", "AIzaCallerOwn")
                    .header("x-custom", "preserved")
                    .body(Body::from(r#"{"contents":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["key"], WORKING_KEY);
        assert_eq!(json["query"], "alt=json");
        assert_eq!(json["path"], "/v1beta/models/gemini-2.0-flash:generateContent");
        assert_eq!(json["method"], "POST");
        assert_eq!(json["body"], r#"{"contents":[]}"#);
        assert_eq!(json["echoed_headers"]["x-custom"], "preserved");

        assert_eq!(pool.status_one("key_1").await.unwrap().rpd_used, 1);
    }

    #[tokio::test]
    async fn daily_quota_rejection_fails_over_to_next_key() {
        let (upstream_url, hits) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, &[DAILY_DONE_KEY, WORKING_KEY]);
        let pool = state.pool.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(generate("/v1beta/models/gemini-2.0-flash:generateContent"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["key"], WORKING_KEY);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let first = pool.status_one("key_1").await.unwrap();
        assert_eq!(first.status, "exhausted");
        assert_eq!(first.rpd_remaining, 0);
        assert_eq!(pool.status_one("key_2").await.unwrap().rpd_used, 1);
    }

    #[tokio::test]
    async fn all_keys_exhausted_returns_503() {
        let (upstream_url, hits) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, &[DAILY_DONE_KEY]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(generate("/v1beta/models/gemini-2.0-flash:generateContent"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], 503);
        assert_eq!(json["error"]["status"], "UNAVAILABLE");
        assert!(json["error"]["next_reset"].is_string());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn minute_throttling_is_retried_up_to_the_bound() {
        let (upstream_url, hits) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, &[THROTTLED_KEY]);
        let pool = state.pool.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(generate("/v1beta/models/gemini-2.0-flash:generateContent"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // Per-minute rejections never change the key's status
        let view = pool.status_one("key_1").await.unwrap();
        assert_eq!(view.status, "active");
        assert_eq!(view.rpm_current, 3);
    }

    #[tokio::test]
    async fn client_errors_pass_through_without_retry() {
        let (upstream_url, hits) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, &[WORKING_KEY, SPARE_KEY]);
        let app = build_router(state, 1000);

        let response = app.oneshot(generate("/v1beta/invalid")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["status"], "INVALID_ARGUMENT");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_fail_over_then_give_up() {
        let (upstream_url, hits) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, &[WORKING_KEY, SPARE_KEY]);
        let pool = state.pool.clone();
        let app = build_router(state, 1000);

        let response = app.oneshot(generate("/v1beta/broken")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let status = pool.status().await;
        let failures: u32 = status.keys.iter().map(|k| k.consecutive_failures).sum();
        assert_eq!(failures, 3);
    }

    #[tokio::test]
    async fn upstream_unreachable_is_503() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let state = test_app_state(&format!("http://{addr}"), &[WORKING_KEY]);
        let app = build_router(state, 1000);

        let response = app.oneshot(generate("/v1beta/models")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn sse_stream_is_passed_through() {
        let (upstream_url, _hits) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, &[WORKING_KEY]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(generate(
                "/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"data: {\"n\":1}\n\ndata: {\"n\":2}\n\n");
    }

    /// Raw upstream that sends one SSE event, pauses for `gap`, then sends another.
    async fn start_slow_stream_upstream(gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request: Vec<u8> = Vec::new();
            let mut buf = [0u8; 4096];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                      transfer-encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            socket.write_all(b"f\r\ndata: {\"n\":1}\n\n\r\n").await.unwrap();
            tokio::time::sleep(gap).await;
            socket
                .write_all(b"f\r\ndata: {\"n\":2}\n\n\r\n0\r\n\r\n")
                .await
                .unwrap();
        });
        url
    }

    #[tokio::test]
    async fn stream_may_outlive_the_upstream_timeout() {
        let upstream_url = start_slow_stream_upstream(Duration::from_millis(300)).await;
        let mut state = test_app_state(&upstream_url, &[WORKING_KEY]);
        state.proxy.timeout = Duration::from_millis(100);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"data: {\"n\":1}\n\ndata: {\"n\":2}\n\n");
    }

    #[tokio::test]
    async fn silent_upstream_times_out_before_headers() {
        // Accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut state = test_app_state(&format!("http://{addr}"), &[WORKING_KEY]);
        state.proxy.timeout = Duration::from_millis(100);
        let app = build_router(state, 1000);

        let response = app.oneshot(generate("/v1beta/models")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let state = test_app_state("http://unused", &[WORKING_KEY]);
        let pool = state.pool.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1beta/models/gemini-2.0-flash:generateContent")
                    .body(Body::from(vec![b'x'; 2 * 1024 * 1024]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(pool.status_one("key_1").await.unwrap().rpd_used, 0);
    }

    #[tokio::test]
    async fn sdk_routes_are_served_on_the_public_router() {
        let state = test_app_state("http://unused", &[WORKING_KEY]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sdk/allocate-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["api_key"], WORKING_KEY);
    }

    #[tokio::test]
    async fn admin_routes_are_not_on_the_public_router() {
        let (upstream_url, _hits) = start_mock_upstream().await;
        let state = test_app_state(&upstream_url, &[WORKING_KEY]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(Request::builder().uri("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        // Falls through to the forwarder, so the mock upstream answers it
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["path"], "/admin/status");
    }
}
