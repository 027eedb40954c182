//! Telemetry agent - per-node network and scheduling telemetry
//!
//! This binary runs as a DaemonSet on each node, attaching the kernel
//! telemetry collector and exporting percentile gauges for the scorer.

use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_agent::{api, config::AgentConfig, source::build_source};
use telemetry_lib::{
    collector::{watch_source, Collector, CollectorConfig, SOURCE_WATCH_INTERVAL},
    estimator::{Exporter, MetricsAgent},
    health::{components, HealthRegistry},
    identity::NodeIdentity,
    observability::StructuredLogger,
};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const SERVICE_NAME: &str = "telemetry-agent";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the debug toggle can pick the log level
    let config = AgentConfig::load()?;

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .with(fmt::layer().json())
        .init();

    info!(node_name = %config.node_name, "Starting telemetry-agent");

    let identity = NodeIdentity::load_or_assign(
        &config.state_dir,
        &config.node_name,
        config.node_id,
        config.max_nodes,
    )
    .await
    .context("Failed to resolve node identity")?;

    // Initialize health registry
    let health_registry = HealthRegistry::new(SERVICE_NAME);
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::EVENT_STREAM).await;
    health_registry.register(components::EXPORTER).await;

    let logger = StructuredLogger::new(SERVICE_NAME, &identity.name);
    logger.log_startup(AGENT_VERSION);

    // Attaching the collector is the one fatal setup step
    let collector_config = CollectorConfig {
        maps: config.maps_config(),
        ..CollectorConfig::new(identity.id)
    };
    let source = build_source(&config).await?;
    let (collector, events) = Collector::attach(collector_config, source)
        .await
        .context("Failed to attach telemetry collector")?;
    logger.log_collector_attached(collector.source_name(), identity.id.0);

    let exporter = Arc::new(Exporter::new());
    let (shutdown_tx, _) = broadcast::channel(1);

    let agent = MetricsAgent::new(
        config.loop_config(identity.id),
        collector.maps(),
        events,
        exporter.clone(),
        health_registry.clone(),
    );
    let agent_handle = tokio::spawn(agent.run(shutdown_tx.subscribe()));

    // A source task that exits on its own leaves the node without telemetry
    let watchdog_handle = tokio::spawn(watch_source(
        collector.liveness(),
        collector.source_name(),
        health_registry.clone(),
        SOURCE_WATCH_INTERVAL,
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), exporter));
    let listener = api::bind(config.api_port).await?;
    let mut api_handle = tokio::spawn(api::serve(listener, app_state, shutdown_tx.subscribe()));

    // Ready once the collector is attached and the loop is running
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
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    if let Err(e) = agent_handle.await {
        error!(error = %e, "Metrics agent task failed");
    }
    if let Err(e) = watchdog_handle.await {
        error!(error = %e, "Source watchdog task failed");
    }

    let source_name = collector.source_name();
    let clean = collector.detach().await.is_ok();
    logger.log_collector_detached(source_name, clean);
    if !api_finished {
        if let Ok(Err(e)) = api_handle.await {
            error!(error = %e, "API server failed during shutdown");
        }
    }

    info!("Shutting down");
    Ok(())
}
