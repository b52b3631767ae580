//! HTTP ingestion pipeline: middleware stack, submission and status handlers.

use crate::email::EmailRecord;
use crate::error::ApiError;
use crate::lifecycle::Lifecycle;
use crate::metrics::{Metrics, Outcome};
use crate::normalize::{self, Sidecar, SubmissionFormat};
use crate::pool::{Pool, PoolError};
use crate::ratelimit::RateLimiter;
use crate::store::Backend;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::Utc;
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::Instrument;

/// Largest submission body read; anything past this is dropped.
pub const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

pub(crate) struct AppState<B: Backend> {
    pub pool: Pool<B>,
    pub lifecycle: Arc<Lifecycle>,
    pub metrics: Arc<Metrics>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub auth_token: Arc<str>,
    pub request_timeout: Duration,
    /// Flips to true when shutdown gives up on in-flight work.
    pub abandon: watch::Receiver<bool>,
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            metrics: Arc::clone(&self.metrics),
            limiter: self.limiter.clone(),
            auth_token: Arc::clone(&self.auth_token),
            request_timeout: self.request_timeout,
            abandon: self.abandon.clone(),
        }
    }
}

/// Server-assigned correlation id for one request.
#[derive(Debug, Clone)]
pub(crate) struct RequestId(pub String);

impl RequestId {
    fn generate() -> Self {
        Self(format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        ))
    }
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    status: &'static str,
    message_id: String,
    stored_at: String,
    timestamp: String,
}

pub(crate) fn router<B: Backend>(state: AppState<B>) -> Router {
    // Layers listed innermost first
    let submission = Router::new()
        .route(
            "/mail/inbound",
            post(submit::<B>).fallback(method_not_allowed),
        )
        .route("/email", post(submit::<B>).fallback(method_not_allowed))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer::<B>,
        ))
        .route_layer(middleware::from_fn(contain_faults))
        .route_layer(middleware::from_fn(assign_request_id))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit::<B>));

    let gated = submission
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_in_flight::<B>,
        ));

    // Status routes stay outside the drain gate so the drain is observable
    Router::new()
        .route("/health", get(health_check::<B>))
        .route("/metrics", get(metrics_json::<B>))
        .route("/metrics/prometheus", get(metrics_prometheus::<B>))
        .merge(gated)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_timeout::<B>,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            record_metrics::<B>,
        ))
        .with_state(state)
}

/// Run the HTTP server until `stop` flips to true.
pub(crate) async fn run_http_server<B: Backend>(
    listener: TcpListener,
    state: AppState<B>,
    mut stop: watch::Receiver<bool>,
) {
    let app = router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
    {
        tracing::error!("HTTP server error: {e}");
    }
}

async fn record_metrics<B: Backend>(
    State(state): State<AppState<B>>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let read = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&read);
    let req = req.map(|body| {
        Body::from_stream(body.into_data_stream().inspect_ok(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }))
    });

    let response = next.run(req).await;

    // Bytes actually read win; chunked bodies carry no Content-Length
    let size = match read.load(Ordering::Relaxed) {
        0 => declared,
        n => Some(n),
    };

    let outcome = response
        .extensions()
        .get::<Outcome>()
        .copied()
        .unwrap_or_else(|| Outcome::from_status(response.status()));
    state.metrics.observe_request(outcome, started.elapsed(), size);
    response
}

async fn enforce_timeout<B: Backend>(
    State(state): State<AppState<B>>,
    req: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(state.request_timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(
                "request exceeded {}",
                humantime::format_duration(state.request_timeout)
            );
            ApiError::Timeout.into_response()
        }
    }
}

async fn track_in_flight<B: Backend>(
    State(state): State<AppState<B>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(guard) = state.lifecycle.try_enter() else {
        return ApiError::Unavailable.into_response();
    };
    state.metrics.set_in_flight(state.lifecycle.in_flight());
    let response = tokio::select! {
        response = next.run(req) => response,
        () = abandoned(state.abandon.clone()) => {
            tracing::warn!("abandoning request at forced shutdown");
            let mut response = ApiError::Unavailable.into_response();
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            response
        }
    };
    drop(guard);
    state.metrics.set_in_flight(state.lifecycle.in_flight());
    response
}

async fn rate_limit<B: Backend>(
    State(state): State<AppState<B>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.limiter {
        if let Err(retry_after) = limiter.check() {
            tracing::debug!(path = %req.uri().path(), "rate limited");
            return ApiError::RateLimited { retry_after }.into_response();
        }
    }
    next.run(req).await
}

async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let id = RequestId::generate();
    let span = tracing::info_span!(
        "request",
        request_id = %id.0,
        method = %req.method(),
        path = %req.uri().path(),
    );
    req.extensions_mut().insert(id.clone());

    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id.0) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn contain_faults(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("request handler panicked: {msg}");
            ApiError::Internal.into_response()
        }
    }
}

async fn require_bearer<B: Backend>(
    State(state): State<AppState<B>>,
    req: Request,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .and_then(|(scheme, token)| scheme.eq_ignore_ascii_case("bearer").then_some(token.trim()));

    match presented {
        None => ApiError::Unauthorized("missing bearer token").into_response(),
        Some(token)
            if !token.is_empty()
                && constant_time_eq::constant_time_eq(
                    token.as_bytes(),
                    state.auth_token.as_bytes(),
                ) =>
        {
            next.run(req).await
        }
        Some(_) => {
            tracing::warn!("rejected invalid bearer token");
            ApiError::Unauthorized("invalid bearer token").into_response()
        }
    }
}

async fn submit<B: Backend>(
    State(state): State<AppState<B>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let raw = read_body(body, MAX_BODY_BYTES).await?;
    let sidecar = sidecar_from_headers(&headers);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let id = request_id.0;
    let record = match SubmissionFormat::detect(content_type, &raw) {
        SubmissionFormat::Rfc822 => normalize::parse_raw(&id, &raw, &sidecar),
        SubmissionFormat::Json => normalize::parse_json(&id, &raw, &sidecar),
    }
    .map_err(|e| {
        tracing::debug!("rejecting submission: {e}");
        ApiError::from(e)
    })?;

    normalize::validate(&record).map_err(ApiError::Validation)?;

    let location = persist(&state, record).await?;
    state.metrics.record_stored(raw.len() as u64);
    tracing::info!(location = %location, bytes = raw.len(), "email stored");

    let body = SubmitResponse {
        status: "success",
        message_id: id,
        stored_at: location,
        timestamp: Utc::now().to_rfc3339(),
    };
    Ok((Extension(Outcome::SUCCESS), Json(body)).into_response())
}

/// Read at most `limit` bytes, dropping the rest.
async fn read_body(body: Body, limit: usize) -> Result<Vec<u8>, ApiError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
        let room = limit - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            tracing::warn!("request body truncated to {limit} bytes");
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn sidecar_from_headers(headers: &HeaderMap) -> Sidecar {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect()
}

/// Completes once shutdown gives up on in-flight work; never if the server
/// handle is dropped without a forced shutdown.
async fn abandoned(mut abandon: watch::Receiver<bool>) {
    if abandon.wait_for(|abandoned| *abandoned).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn persist<B: Backend>(state: &AppState<B>, record: EmailRecord) -> Result<String, ApiError> {
    let cancel = abandoned(state.abandon.clone());
    let mut handle = state.pool.acquire_or_cancel(cancel).await.map_err(|e| {
        tracing::error!("failed to acquire storage handle: {e}");
        match e {
            PoolError::Closed | PoolError::Cancelled => ApiError::Unavailable,
            PoolError::Timeout(_) | PoolError::Create(_) => ApiError::Storage,
        }
    })?;

    match tokio::task::spawn_blocking(move || handle.store(&record)).await {
        Ok(Ok(location)) => Ok(location),
        Ok(Err(e)) => {
            tracing::error!("failed to store email: {e}");
            Err(ApiError::Storage)
        }
        Err(e) => {
            tracing::error!("storage task failed: {e}");
            Err(ApiError::Internal)
        }
    }
}

async fn health_check<B: Backend>(State(state): State<AppState<B>>) -> Json<serde_json::Value> {
    let uptime = Duration::from_secs(state.metrics.uptime().as_secs());
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": humantime::format_duration(uptime).to_string(),
    }))
}

async fn metrics_json<B: Backend>(State(state): State<AppState<B>>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot();
    let pool = state.pool.stats();
    Json(json!({
        "total_emails": snapshot.total_emails,
        "total_bytes": snapshot.total_bytes,
        "last_received": snapshot.last_received.map(|t| t.to_rfc3339()),
        "uptime_seconds": snapshot.uptime_seconds,
        "start_time": snapshot.start_time.to_rfc3339(),
        "active_requests": state.lifecycle.in_flight(),
        "shutting_down": state.lifecycle.is_draining(),
        "pool": {
            "created": pool.created,
            "active": pool.active,
            "idle": pool.idle,
            "max_size": pool.max_size,
            "wait_count": pool.wait_count,
            "average_wait_ms": u64::try_from(pool.average_wait.as_millis()).unwrap_or(u64::MAX),
        },
    }))
}

async fn metrics_prometheus<B: Backend>(
    State(state): State<AppState<B>>,
) -> Result<Response, ApiError> {
    let text = state.metrics.render().map_err(|e| {
        tracing::error!("failed to encode metrics: {e}");
        ApiError::Internal
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}
