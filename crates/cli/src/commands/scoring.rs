//! Score cache and scoring protocol commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;
use telemetry_lib::scorer::{
    CacheSnapshot, ExtenderArgs, ExtenderFilterResult, HostPriorityList,
};

use crate::client::ApiClient;
use crate::output::{
    color_score, color_status, format_age, print_json, print_table, print_warning, OutputFormat,
};

/// Row for the cache table
#[derive(Tabled)]
struct CacheRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "RTT p99 (ms)")]
    rtt_p99: String,
    #[tabled(rename = "Retrans/s")]
    retrans: String,
    #[tabled(rename = "Drops/s")]
    drops: String,
    #[tabled(rename = "Runqlat p95 (ms)")]
    runqlat_p95: String,
    #[tabled(rename = "CPU %")]
    cpu: String,
}

/// Row for the prioritize table
#[derive(Tabled)]
struct PriorityRow {
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Score")]
    score: i64,
}

/// Row for the filter table
#[derive(Tabled)]
struct FilterRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Eligible")]
    eligible: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Show the extender's score cache
pub async fn show_cache(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let snapshot: CacheSnapshot = client.get("cache").await?;

    if format == OutputFormat::Json {
        return print_json(&snapshot);
    }

    println!("{}", "Score Cache".bold());
    println!("{}", "=".repeat(60));
    println!("State:      {}", color_status(snapshot.state.as_str()));
    match (snapshot.refreshed_at, snapshot.age_secs) {
        (Some(at), Some(age)) => println!(
            "Refreshed:  {} ({} ago)",
            at.format("%Y-%m-%d %H:%M:%S UTC"),
            format_age(age)
        ),
        _ => println!("Refreshed:  {}", "never".red()),
    }
    if let Some(error) = &snapshot.last_error {
        print_warning(&format!("Last refresh failed: {}", error));
    }
    println!();

    let rows: Vec<CacheRow> = snapshot
        .entries
        .iter()
        .map(|e| CacheRow {
            node: e.node_name.clone(),
            score: color_score(e.score),
            rtt_p99: format!("{:.2}", e.raw.rtt_p99_ms),
            retrans: format!("{:.2}", e.raw.retrans_rate),
            drops: format!("{:.2}", e.raw.drop_rate),
            runqlat_p95: format!("{:.2}", e.raw.runqlat_p95_ms),
            cpu: format!("{:.1}", e.raw.cpu_util),
        })
        .collect();
    let total = rows.len();
    print_table(rows);
    println!("\nTotal: {} nodes", total);

    Ok(())
}

/// Call `prioritize` for `nodes` and print them best first
pub async fn score_nodes(client: &ApiClient, nodes: Vec<String>, format: OutputFormat) -> Result<()> {
    let mut priorities: HostPriorityList = client
        .post("prioritize", &ExtenderArgs::from_names(nodes))
        .await?;

    if format == OutputFormat::Json {
        return print_json(&priorities);
    }

    priorities.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.host.cmp(&b.host)));
    let rows: Vec<PriorityRow> = priorities
        .into_iter()
        .enumerate()
        .map(|(i, p)| PriorityRow {
            rank: i + 1,
            node: p.host,
            score: p.score,
        })
        .collect();
    print_table(rows);

    Ok(())
}

/// Call `filter` for `nodes` and print the verdict per node
pub async fn filter_nodes(client: &ApiClient, nodes: Vec<String>, format: OutputFormat) -> Result<()> {
    let result: ExtenderFilterResult = client
        .post("filter", &ExtenderArgs::from_names(nodes.clone()))
        .await?;

    if format == OutputFormat::Json {
        return print_json(&result);
    }

    if !result.error.is_empty() {
        print_warning(&format!("Extender reported: {}", result.error));
    }

    let eligible = result.node_names.unwrap_or_default();
    let rows: Vec<FilterRow> = nodes
        .into_iter()
        .map(|node| {
            let reason = result.failed_nodes.get(&node).cloned();
            let passed = eligible.contains(&node);
            FilterRow {
                eligible: if passed {
                    "yes".green().to_string()
                } else {
                    "no".red().to_string()
                },
                reason: reason.unwrap_or_default(),
                node,
            }
        })
        .collect();
    print_table(rows);

    Ok(())
}
