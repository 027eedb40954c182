//! Extender health command

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::Tabled;
use telemetry_lib::ReadinessResponse;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, print_success, print_table, print_warning, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

#[derive(Serialize)]
struct HealthReport {
    health: Value,
    readiness: ReadinessResponse,
}

/// Show `/healthz` and `/readyz` of the extender
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (_, health): (_, Value) = client.get_json_any_status("healthz").await?;
    let (_, readiness): (_, ReadinessResponse) = client.get_json_any_status("readyz").await?;

    if format == OutputFormat::Json {
        return print_json(&HealthReport { health, readiness });
    }

    let text = |v: &Value| v.as_str().unwrap_or("-").to_string();

    println!("{}", "Extender Health".bold());
    println!("{}", "=".repeat(50));
    println!("Endpoint:    {}", client.base_url().as_str().cyan());
    println!("Status:      {}", color_status(&text(&health["status"])));
    println!("Cache:       {}", color_status(&text(&health["cache_state"])));
    if let Some(uptime) = health["uptime_secs"].as_i64() {
        println!("Uptime:      {}s", uptime);
    }
    println!();

    let mut rows: Vec<ComponentRow> = health["components"]
        .as_object()
        .map(|components| {
            components
                .iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&text(&c["status"])),
                    message: c["message"].as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    print_table(rows);
    println!();

    if readiness.ready {
        print_success("Ready");
    } else {
        print_warning(&format!(
            "Not ready: {}",
            readiness.reason.as_deref().unwrap_or("unknown reason")
        ));
    }

    Ok(())
}
