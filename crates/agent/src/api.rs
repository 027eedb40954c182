//! HTTP API for health checks and exported metrics

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use telemetry_lib::{
    estimator::Exporter,
    health::HealthRegistry,
    observability::gather_default_registry,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub exporter: Arc<Exporter>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, exporter: Arc<Exporter>) -> Self {
        Self {
            health_registry,
            exporter,
        }
    }
}

/// Component health; 503 once any component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    (operational_status(health.status.is_operational()), Json(health))
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

/// Latest export snapshot followed by the agent's own metrics
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = async {
        let mut body = state.exporter.render().await?;
        body.push_str(&gather_default_registry()?);
        anyhow::Ok(body)
    }
    .await;

    match body {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("failed to encode metrics: {}", e),
            )
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
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
