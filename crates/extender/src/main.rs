//! Scheduler extender - network-aware node scoring
//!
//! This binary serves the orchestrator's extender calls, ranking nodes by
//! the telemetry the per-node agents export to the metrics store.

use anyhow::{Context, Result};
use scheduler_extender::{api, config::ExtenderConfig};
use std::sync::Arc;
use std::time::Duration;
use telemetry_lib::{
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    scorer::{FilterChain, NodeScorer, PrometheusStore},
};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXTENDER_VERSION: &str = env!("CARGO_PKG_VERSION");
const SERVICE_NAME: &str = "scheduler-extender";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the debug toggle can pick the log level
    let config = ExtenderConfig::load().context("Invalid extender configuration")?;

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .with(fmt::layer().json())
        .init();

    info!(
        metrics_store = %config.metrics_store_url,
        port = config.port,
        cache_ttl_secs = config.cache_ttl_secs,
        refresh_timeout_secs = config.refresh_timeout_secs,
        min_score = ?config.min_score,
        "Starting scheduler-extender"
    );

    let health_registry = HealthRegistry::new(SERVICE_NAME);
    health_registry.register(components::SCORE_CACHE).await;
    health_registry.register(components::METRICS_STORE).await;

    let logger = StructuredLogger::new(SERVICE_NAME, "-");
    logger.log_startup(EXTENDER_VERSION);

    let store = PrometheusStore::new(
        &config.metrics_store_url,
        Duration::from_secs(config.refresh_timeout_secs),
    )
    .context("Invalid metrics store URL")?;

    let scorer = Arc::new(NodeScorer::new(
        Arc::new(store),
        config.scorer_config(),
        health_registry.clone(),
    ));
    let filter_chain = FilterChain::from_min_score(config.min_score);
    info!(predicates = ?filter_chain.names(), "Admission predicates configured");

    let (shutdown_tx, _) = broadcast::channel(1);
    let refresher = tokio::spawn(scorer.clone().run_refresher(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        scorer,
        filter_chain,
        health_registry.clone(),
    ));
    let listener = api::bind(config.port).await?;
    let mut api_handle = tokio::spawn(api::serve(listener, app_state, shutdown_tx.subscribe()));

    // A cold cache still answers with neutral scores
    health_registry.set_ready(true).await;

    let (reason, api_finished) = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            ("SIGINT received", false)
        }
        served = &mut api_handle => {
            match served {
                Ok(Ok(())) => ("API server stopped", true),
                Ok(Err(e)) => {
                    error!(error = %e, "API server failed");
                    return Err(e.context("API server failed"));
                }
                Err(e) => return Err(e).context("API server task panicked"),
            }
        }
    };

    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());
    if let Err(e) = refresher.await {
        error!(error = %e, "Cache refresher task failed");
    }
    if !api_finished {
        if let Ok(Err(e)) = api_handle.await {
            error!(error = %e, "API server failed during shutdown");
        }
    }

    info!("Shutting down");
    Ok(())
}
