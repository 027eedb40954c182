//! Command implementations

pub mod health;
pub mod scoring;
pub mod telemetry;
