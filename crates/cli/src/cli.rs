//! Command-line definition

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};

/// Network-aware scheduling CLI
#[derive(Debug, Parser)]
#[command(name = "netsched")]
#[command(author, version, about = "CLI for network-aware scheduling", long_about = None)]
pub struct Cli {
    /// Scheduler extender URL (can also be set via NETSCHED_EXTENDER_URL env var)
    #[arg(long, env = "NETSCHED_EXTENDER_URL", default_value = "http://localhost:8080")]
    pub extender_url: String,

    /// Node agent URL (can also be set via NETSCHED_AGENT_URL env var)
    #[arg(long, env = "NETSCHED_AGENT_URL", default_value = "http://localhost:9100")]
    pub agent_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Dump the extender's per-node score cache
    Cache,

    /// Ask the extender to prioritize nodes
    Score {
        /// Candidate node names
        #[arg(required = true)]
        nodes: Vec<String>,
    },

    /// Ask the extender which nodes pass its filter
    Filter {
        /// Candidate node names
        #[arg(required = true)]
        nodes: Vec<String>,
    },

    /// Show extender health and readiness
    Health,

    /// Tabulate the gauges exported by a node agent
    Telemetry {
        /// Only show this node
        #[arg(long, short)]
        node: Option<String>,
    },
}
