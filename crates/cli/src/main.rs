//! Network-aware scheduling CLI
//!
//! A command-line tool for inspecting the scheduler extender's score
//! cache, issuing ad-hoc scoring calls and reading node agent telemetry.

use anyhow::Result;
use clap::Parser;
use netsched_cli::cli::{Cli, Commands};
use netsched_cli::client::ApiClient;
use netsched_cli::commands::{health, scoring, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Cache => {
            let client = ApiClient::new(&cli.extender_url)?;
            scoring::show_cache(&client, cli.format).await?;
        }
        Commands::Score { nodes } => {
            let client = ApiClient::new(&cli.extender_url)?;
            scoring::score_nodes(&client, nodes, cli.format).await?;
        }
        Commands::Filter { nodes } => {
            let client = ApiClient::new(&cli.extender_url)?;
            scoring::filter_nodes(&client, nodes, cli.format).await?;
        }
        Commands::Health => {
            let client = ApiClient::new(&cli.extender_url)?;
            health::show_health(&client, cli.format).await?;
        }
        Commands::Telemetry { node } => {
            let client = ApiClient::new(&cli.agent_url)?;
            telemetry::show_telemetry(&client, node, cli.format).await?;
        }
    }

    Ok(())
}
