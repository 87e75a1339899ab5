mod cutout;
mod http;
mod llm;
mod matcher;
mod metrics;
mod models;
mod normalize;
mod resolver;
mod search;
mod singleflight;
mod storage;
mod store;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BatchItemReport, BatchItemStatus, BatchResolveRequest, ResolveRequest,
    ResolveResponse,
};
use resolver::{ResolveError, Resolver};
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use store::Store;
use tokio::sync::Semaphore;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "vitrine.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://vitrine.db?mode=rwc".into());
    let store = Store::connect(&database_url).await?;
    let resolver = Arc::new(Resolver::from_env(store.clone()));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let state = AppState {
        resolver,
        store,
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/resolve", post(resolve_one))
        .route("/resolve/batch", post(resolve_batch))
        .route("/registry/{identity_key}", get(registry_get))
        .route("/registry/{identity_key}/approve", post(registry_approve))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "vitrine.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    resolver: Arc<Resolver>,
    store: Store,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "vitrine-api-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap_or_default();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap_or_default()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn batch_concurrency() -> usize {
    std::env::var("BATCH_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4)
}

fn batch_max_items() -> usize {
    std::env::var("BATCH_MAX_ITEMS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(50)
}

/// Resolve a single product description to a canonical image URL.
///
/// - Method: `POST`
/// - Path: `/resolve`
/// - Body: `ResolveRequest`
/// - Response: `ResolveResponse`
async fn resolve_one(
    State(state): State<AppState>,
    Json(payload): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, AppError> {
    crate::metrics::inc_requests("/resolve");
    let request_id = uuid::Uuid::new_v4();
    info!(
        target = "vitrine.api",
        request_id = %request_id,
        term = %payload.term,
        strict = payload.strict_mode,
        "resolve_invoked"
    );
    let response = state.resolver.resolve(&payload).await?;
    Ok(Json(response))
}

/// Resolve a batch of products with bounded parallelism. One failing item
/// never fails the batch.
///
/// - Method: `POST`
/// - Path: `/resolve/batch`
async fn resolve_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchResolveRequest>,
) -> Result<Json<Vec<BatchItemReport>>, AppError> {
    crate::metrics::inc_requests("/resolve/batch");
    if payload.items.is_empty() {
        return Err(AppError::Resolve(ResolveError::InvalidInput(
            "empty batch".into(),
        )));
    }
    if payload.items.len() > batch_max_items() {
        return Err(AppError::Resolve(ResolveError::InvalidInput(format!(
            "batch exceeds {} items",
            batch_max_items()
        ))));
    }

    let semaphore = Arc::new(Semaphore::new(batch_concurrency()));
    let mut handles = Vec::with_capacity(payload.items.len());
    for item in payload.items {
        let resolver = state.resolver.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let started = Instant::now();
            let term = item.term.clone();
            let outcome = resolver.resolve(&item).await;
            batch_report(term, outcome, started.elapsed().as_millis())
        }));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(err) => reports.push(BatchItemReport {
                term: String::new(),
                status: BatchItemStatus::Error,
                url: None,
                source: None,
                reason: Some(format!("item task failed: {err}")),
                elapsed_ms: 0,
                timestamp: Utc::now(),
            }),
        }
    }
    Ok(Json(reports))
}

fn batch_report(
    term: String,
    outcome: Result<ResolveResponse, ResolveError>,
    elapsed_ms: u128,
) -> BatchItemReport {
    let (status, url, source, reason) = match outcome {
        Ok(response) if response.found => {
            let status = if response.review_pending == Some(true) {
                BatchItemStatus::ReviewPending
            } else {
                BatchItemStatus::Done
            };
            (status, response.url, response.source, None)
        }
        Ok(response) => (BatchItemStatus::Error, None, None, response.reason),
        Err(err) => (BatchItemStatus::Error, None, None, Some(err.to_string())),
    };
    BatchItemReport {
        term,
        status,
        url,
        source,
        reason,
        elapsed_ms,
        timestamp: Utc::now(),
    }
}

async fn registry_get(
    State(state): State<AppState>,
    Path(identity_key): Path<String>,
) -> Result<Json<store::RegistryEntry>, AppError> {
    crate::metrics::inc_requests("/registry");
    match state.store.registry_get(&identity_key).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(AppError::NotFound),
    }
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    validated_by: String,
}

/// Manual promotion of a review-pending binding.
///
/// - Method: `POST`
/// - Path: `/registry/{identity_key}/approve`
async fn registry_approve(
    State(state): State<AppState>,
    Path(identity_key): Path<String>,
    Json(payload): Json<ApproveRequest>,
) -> Result<Json<store::RegistryEntry>, AppError> {
    crate::metrics::inc_requests("/registry/approve");
    let validated_by = payload.validated_by.trim();
    if validated_by.is_empty() {
        return Err(AppError::Resolve(ResolveError::InvalidInput(
            "validated_by is required".into(),
        )));
    }
    match state.store.approve(&identity_key, validated_by).await? {
        Some(entry) => {
            info!(
                target = "vitrine.api",
                identity_key = %identity_key,
                validated_by = %validated_by,
                "registry_entry_approved"
            );
            Ok(Json(entry))
        }
        None => Err(AppError::NotFound),
    }
}

#[derive(Debug)]
enum AppError {
    Resolve(ResolveError),
    NotFound,
}

impl From<ResolveError> for AppError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

impl From<store::StoreError> for AppError {
    fn from(value: store::StoreError) -> Self {
        Self::Resolve(ResolveError::Store(value))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => {
                let payload = ApiError {
                    error: "not_found".into(),
                    detail: None,
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
            AppError::Resolve(err) => {
                let status = match &err {
                    ResolveError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    ResolveError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                    ResolveError::QualityGate => StatusCode::UNPROCESSABLE_ENTITY,
                    ResolveError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
                    ResolveError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let retry_after = match &err {
                    ResolveError::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                let payload = ApiError {
                    error: error_code(&err).into(),
                    detail: Some(err.to_string()),
                };
                let mut response = (status, Json(payload)).into_response();
                if let Some(seconds) = retry_after {
                    if let Ok(value) = seconds.to_string().parse() {
                        response.headers_mut().insert("Retry-After", value);
                    }
                }
                response
            }
        }
    }
}

fn error_code(err: &ResolveError) -> &'static str {
    match err {
        ResolveError::InvalidInput(_) => "invalid_input",
        ResolveError::RateLimited { .. } => "rate_limited",
        ResolveError::Transient(_) => "upstream_unavailable",
        ResolveError::QualityGate => "quality_gate",
        ResolveError::Store(_) => "storage_error",
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
