//! Telemetry library for network-aware scheduling
//!
//! This crate provides the core functionality for:
//! - Kernel telemetry collection into fixed-size per-node tables
//! - Percentile estimation and metrics export
//! - Node scoring for the scheduler extender
//! - Health checks and observability

pub mod collector;
pub mod estimator;
pub mod health;
pub mod identity;
pub mod models;
pub mod observability;
pub mod scorer;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use identity::NodeIdentity;
pub use models::*;
pub use observability::{AgentMetrics, ExtenderMetrics, StructuredLogger};
