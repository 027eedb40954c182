//! Per-node telemetry agent
//!
//! Attaches the collector, runs the metrics agent loop and serves the
//! exported gauges alongside health endpoints.

pub mod api;
pub mod config;
pub mod source;
