//! Scheduler extender
//!
//! Answers the orchestrator's filter and prioritize calls from a cached,
//! periodically refreshed view of the per-node telemetry.

pub mod api;
pub mod config;
