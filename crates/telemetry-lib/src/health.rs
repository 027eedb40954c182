//! Component health tracking for the agent and the extender
//!
//! Backs the `/healthz` and `/readyz` endpoints of both services. Each
//! service registers the components it owns and flips readiness once its
//! setup-critical component is up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operating on a fallback, e.g. a stale score cache
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub service: String,
    pub status: ComponentStatus,
    pub uptime_secs: i64,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components; no components is healthy
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names
pub mod components {
    /// Kernel telemetry collector attachment
    pub const COLLECTOR: &str = "collector";
    /// Diagnostic event stream consumer
    pub const EVENT_STREAM: &str = "event_stream";
    /// Periodic gauge export
    pub const EXPORTER: &str = "exporter";
    /// Scorer cache generation
    pub const SCORE_CACHE: &str = "score_cache";
    /// Upstream metrics store
    pub const METRICS_STORE: &str = "metrics_store";
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    service: String,
    started_at: DateTime<Utc>,
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            started_at: Utc::now(),
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().await.get(name).map(|c| c.status)
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        HealthResponse {
            service: self.service.clone(),
            status: HealthResponse::compute_status(&components),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            components,
        }
    }

    /// Ready once marked ready and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let status = self.health().await.status;

        let reason = if !ready {
            Some(format!("{} not yet initialized", self.service))
        } else if status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy".to_string())
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let registry = HealthRegistry::new("telemetry-agent");
        let health = registry.health().await;

        assert_eq!(health.service, "telemetry-agent");
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new("scheduler-extender");
        registry.register(components::SCORE_CACHE).await;
        registry.register(components::METRICS_STORE).await;

        registry
            .set_degraded(components::SCORE_CACHE, "serving stale cache")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::METRICS_STORE, "connection refused")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
        assert_eq!(
            registry.status_of(components::SCORE_CACHE).await,
            Some(ComponentStatus::Degraded)
        );
    }

    #[tokio::test]
    async fn test_readiness() {
        let registry = HealthRegistry::new("telemetry-agent");
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("telemetry-agent not yet initialized")
        );

        registry.register(components::COLLECTOR).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::COLLECTOR, "detached")
            .await;
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_degraded_component_stays_ready() {
        let registry = HealthRegistry::new("scheduler-extender");
        registry.set_ready(true).await;
        registry
            .set_degraded(components::SCORE_CACHE, "stale")
            .await;

        assert!(registry.readiness().await.ready);
        assert!(ComponentStatus::Degraded.is_operational());
    }
}
