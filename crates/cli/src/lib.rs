//! Network-aware scheduling CLI
//!
//! Inspects the scheduler extender's score cache, issues ad-hoc scoring
//! calls and tabulates the gauges a node agent exports.

pub mod cli;
pub mod client;
pub mod commands;
pub mod output;
