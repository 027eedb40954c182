//! Agent telemetry command

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tabled::Tabled;
use telemetry_lib::estimator::{
    CPU_UTILIZATION, DROP_RATE, RETRANS_RATE, RTT_P50, RTT_P99, RUNQLAT_P95,
};

use crate::client::ApiClient;
use crate::output::{format_value, print_json, print_table, OutputFormat};

/// Exported gauges of one node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeTelemetry {
    pub node: String,
    pub rtt_p50_ms: Option<f64>,
    pub rtt_p99_ms: Option<f64>,
    pub retrans_rate: Option<f64>,
    pub drop_rate: Option<f64>,
    pub runqlat_p95_ms: Option<f64>,
    pub cpu_utilization: Option<f64>,
}

impl NodeTelemetry {
    fn slot(&mut self, metric: &str) -> Option<&mut Option<f64>> {
        match metric {
            RTT_P50 => Some(&mut self.rtt_p50_ms),
            RTT_P99 => Some(&mut self.rtt_p99_ms),
            RETRANS_RATE => Some(&mut self.retrans_rate),
            DROP_RATE => Some(&mut self.drop_rate),
            RUNQLAT_P95 => Some(&mut self.runqlat_p95_ms),
            CPU_UTILIZATION => Some(&mut self.cpu_utilization),
            _ => None,
        }
    }
}

#[derive(Tabled)]
struct TelemetryRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "RTT p50 (ms)")]
    rtt_p50: String,
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

/// Split `name{node="x",...} value` into its metric name, node label and
/// value. Lines without a `node` label are ignored.
fn parse_sample(line: &str) -> Option<(&str, &str, f64)> {
    let (name, rest) = line.split_once('{')?;
    let (labels, value) = rest.rsplit_once('}')?;

    let node = labels.split(',').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == "node").then(|| value.trim().trim_matches('"'))
    })?;
    let value = value.split_whitespace().next()?.parse().ok()?;

    Some((name.trim(), node, value))
}

/// Collect the per-node `ebpf_*` gauges from a text exposition
pub fn parse_exposition(text: &str) -> Vec<NodeTelemetry> {
    let mut nodes: BTreeMap<String, NodeTelemetry> = BTreeMap::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((metric, node, value)) = parse_sample(line) else {
            continue;
        };
        let entry = nodes.entry(node.to_string()).or_insert_with(|| NodeTelemetry {
            node: node.to_string(),
            ..Default::default()
        });
        if let Some(slot) = entry.slot(metric) {
            *slot = Some(value);
        }
    }

    // Nodes that only appeared on unrelated series
    nodes
        .into_values()
        .filter(|n| {
            n.rtt_p50_ms.is_some()
                || n.rtt_p99_ms.is_some()
                || n.retrans_rate.is_some()
                || n.drop_rate.is_some()
                || n.runqlat_p95_ms.is_some()
                || n.cpu_utilization.is_some()
        })
        .collect()
}

/// Scrape an agent's `/metrics` and show its gauges per node
pub async fn show_telemetry(
    client: &ApiClient,
    node: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let text = client.get_text("metrics").await?;
    let mut nodes = parse_exposition(&text);
    if let Some(node) = &node {
        nodes.retain(|n| &n.node == node);
    }

    if format == OutputFormat::Json {
        return print_json(&nodes);
    }

    let rows: Vec<TelemetryRow> = nodes
        .iter()
        .map(|n| TelemetryRow {
            node: n.node.clone(),
            rtt_p50: format_value(n.rtt_p50_ms, 2),
            rtt_p99: format_value(n.rtt_p99_ms, 2),
            retrans: format_value(n.retrans_rate, 2),
            drops: format_value(n.drop_rate, 2),
            runqlat_p95: format_value(n.runqlat_p95_ms, 2),
            cpu: format_value(n.cpu_utilization, 1),
        })
        .collect();
    print_table(rows);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRAPE: &str = r#"# HELP ebpf_rtt_p99_milliseconds 99th percentile RTT in milliseconds
# TYPE ebpf_rtt_p99_milliseconds gauge
ebpf_rtt_p99_milliseconds{node="node-4"} 16
ebpf_rtt_p99_milliseconds{node="worker-1"} 2
# TYPE ebpf_rtt_p50_milliseconds gauge
ebpf_rtt_p50_milliseconds{node="worker-1"} 1
ebpf_cpu_utilization{node="worker-1"} 37.5
ebpf_drop_reason_total{reason="0"} 12
netsched_agent_nodes_tracked 2
netsched_agent_events_processed_total{kind="rtt",node="ignored"} 9
"#;

    #[test]
    fn test_parse_exposition_groups_by_node() {
        let nodes = parse_exposition(SCRAPE);
        assert_eq!(nodes.len(), 2);

        assert_eq!(nodes[0].node, "node-4");
        assert_eq!(nodes[0].rtt_p99_ms, Some(16.0));
        assert_eq!(nodes[0].cpu_utilization, None);

        assert_eq!(nodes[1].node, "worker-1");
        assert_eq!(nodes[1].rtt_p50_ms, Some(1.0));
        assert_eq!(nodes[1].rtt_p99_ms, Some(2.0));
        assert_eq!(nodes[1].cpu_utilization, Some(37.5));
    }

    #[test]
    fn test_parse_sample() {
        assert_eq!(
            parse_sample(r#"ebpf_drop_rate{node="a", zone="z"} 3.5"#),
            Some(("ebpf_drop_rate", "a", 3.5))
        );
        assert_eq!(parse_sample(r#"ebpf_drop_reason_total{reason="0"} 1"#), None);
        assert_eq!(parse_sample("netsched_agent_nodes_tracked 2"), None);
        assert_eq!(parse_sample(r#"ebpf_drop_rate{node="a"} NaNx"#), None);
    }
}
