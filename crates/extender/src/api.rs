//! HTTP API: the extender protocol plus health, cache and metrics endpoints

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use telemetry_lib::{
    health::{HealthRegistry, HealthResponse},
    observability::{gather_default_registry, ExtenderMetrics},
    scorer::{CacheState, ExtenderArgs, FilterChain, NodeScorer},
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Shared application state
pub struct AppState {
    pub scorer: Arc<NodeScorer>,
    pub filter_chain: FilterChain,
    pub health_registry: HealthRegistry,
    pub metrics: ExtenderMetrics,
}

impl AppState {
    pub fn new(
        scorer: Arc<NodeScorer>,
        filter_chain: FilterChain,
        health_registry: HealthRegistry,
    ) -> Self {
        Self {
            scorer,
            filter_chain,
            health_registry,
            metrics: ExtenderMetrics::new(),
        }
    }
}

/// `/healthz` body: component health plus the cache state
#[derive(Debug, Serialize, Deserialize)]
pub struct ExtenderHealth {
    #[serde(flatten)]
    pub health: HealthResponse,
    pub cache_state: CacheState,
}

fn bad_request(endpoint: &str, error: serde_json::Error) -> Response {
    warn!(endpoint = endpoint, error = %error, "Failed to decode extender request");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("invalid request body: {}", error) })),
    )
        .into_response()
}

/// Decode the whole body or nothing
fn decode(body: &Bytes) -> Result<ExtenderArgs, serde_json::Error> {
    serde_json::from_slice(body)
}

async fn filter(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let args = match decode(&body) {
        Ok(args) => args,
        Err(e) => {
            state
                .metrics
                .observe_request("filter", "bad_request", started.elapsed());
            return bad_request("filter", e);
        }
    };

    let result = state.scorer.filter(&state.filter_chain, &args).await;
    debug!(
        candidates = args.candidate_names().len(),
        failed = result.failed_nodes.len(),
        "Filter handled"
    );
    state
        .metrics
        .observe_request("filter", "ok", started.elapsed());

    Json(result).into_response()
}

async fn prioritize(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let args = match decode(&body) {
        Ok(args) => args,
        Err(e) => {
            state
                .metrics
                .observe_request("prioritize", "bad_request", started.elapsed());
            return bad_request("prioritize", e);
        }
    };

    let priorities = state.scorer.prioritize(&args).await;
    debug!(
        workload = %args.workload().display_name(),
        candidates = priorities.len(),
        "Prioritize handled"
    );
    state
        .metrics
        .observe_request("prioritize", "ok", started.elapsed());

    Json(priorities).into_response()
}

/// Plain liveness for the orchestrator's extender probe
async fn health() -> &'static str {
    "OK"
}

/// Component health plus cache state; a stale or cold cache is
/// degraded, which still answers 200
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status = operational_status(health.status.is_operational());
    let cache_state = state.scorer.state().await;
    (status, Json(ExtenderHealth { health, cache_state }))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    (operational_status(readiness.ready), Json(readiness))
}

fn operational_status(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Dump of the current cache generation
async fn cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scorer.snapshot().await)
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    match gather_default_registry() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/filter", post(filter))
        .route("/prioritize", post(prioritize))
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/cache", get(cache))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind the API port; failing to bind is a setup error
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "API server listening");
    Ok(listener)
}

/// Serve until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
