//! Pull-scrapable export of the agent's gauges
//!
//! The exporter holds exactly one snapshot. Each export cycle builds a new
//! [`ExportSnapshot`] and swaps it in; scrapes render whichever snapshot is
//! current. Nothing is retained across cycles.

use crate::collector::LossSnapshot;
use anyhow::Result;
use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const RTT_P50: &str = "ebpf_rtt_p50_milliseconds";
pub const RTT_P99: &str = "ebpf_rtt_p99_milliseconds";
pub const RETRANS_RATE: &str = "ebpf_tcp_retrans_rate";
pub const DROP_RATE: &str = "ebpf_drop_rate";
pub const RUNQLAT_P95: &str = "ebpf_runqlat_p95_milliseconds";
pub const CPU_UTILIZATION: &str = "ebpf_cpu_utilization";
pub const DROP_REASON_TOTAL: &str = "ebpf_drop_reason_total";
pub const EVENTS_LOST: &str = "ebpf_collector_events_lost";

const NODE_GAUGES: [(&str, &str); 6] = [
    (RTT_P50, "50th percentile RTT in milliseconds"),
    (RTT_P99, "99th percentile RTT in milliseconds"),
    (RETRANS_RATE, "TCP retransmission rate per second"),
    (DROP_RATE, "Packet drop rate per second"),
    (RUNQLAT_P95, "95th percentile runqueue latency in milliseconds"),
    (CPU_UTILIZATION, "CPU utilization percentage"),
];

/// One named gauge value scoped to a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedSample {
    pub name: &'static str,
    pub node: String,
    pub value: f64,
}

/// Gauges derived for one node during an export cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeExport {
    pub node: String,
    pub rtt_p50_ms: f64,
    pub rtt_p99_ms: f64,
    pub retrans_rate: f64,
    pub drop_rate: f64,
    pub runqlat_p95_ms: f64,
    /// Only known for the node the agent runs on
    pub cpu_utilization: Option<f64>,
}

impl NodeExport {
    pub fn samples(&self) -> Vec<ExportedSample> {
        let mut values = vec![
            (RTT_P50, self.rtt_p50_ms),
            (RTT_P99, self.rtt_p99_ms),
            (RETRANS_RATE, self.retrans_rate),
            (DROP_RATE, self.drop_rate),
            (RUNQLAT_P95, self.runqlat_p95_ms),
        ];
        if let Some(cpu) = self.cpu_utilization {
            values.push((CPU_UTILIZATION, cpu));
        }

        values
            .into_iter()
            .map(|(name, value)| ExportedSample {
                name,
                node: self.node.clone(),
                value,
            })
            .collect()
    }
}

/// Everything published by one export cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub nodes: Vec<NodeExport>,
    /// `(reason code, cumulative count)`
    pub drop_reasons: Vec<(u32, u64)>,
    pub lost: LossSnapshot,
    pub generated_at: DateTime<Utc>,
}

impl Default for ExportSnapshot {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            drop_reasons: Vec::new(),
            lost: LossSnapshot::default(),
            generated_at: Utc::now(),
        }
    }
}

impl ExportSnapshot {
    pub fn samples(&self) -> Vec<ExportedSample> {
        self.nodes.iter().flat_map(NodeExport::samples).collect()
    }

    /// Render in the text exposition format.
    ///
    /// A private registry per render keeps the output limited to this
    /// snapshot's series.
    pub fn render(&self) -> Result<String> {
        let registry = Registry::new();

        let mut gauges = Vec::with_capacity(NODE_GAUGES.len());
        for (name, help) in NODE_GAUGES {
            let gauge = GaugeVec::new(Opts::new(name, help), &["node"])?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.push((name, gauge));
        }
        for sample in self.samples() {
            if let Some((_, gauge)) = gauges.iter().find(|(name, _)| *name == sample.name) {
                gauge
                    .with_label_values(&[sample.node.as_str()])
                    .set(sample.value);
            }
        }

        let reasons = IntGaugeVec::new(
            Opts::new(DROP_REASON_TOTAL, "Packet drops by kernel drop reason"),
            &["reason"],
        )?;
        registry.register(Box::new(reasons.clone()))?;
        for (reason, count) in &self.drop_reasons {
            let reason = reason.to_string();
            reasons
                .with_label_values(&[reason.as_str()])
                .set(*count as i64);
        }

        let lost = IntGaugeVec::new(
            Opts::new(EVENTS_LOST, "Event contributions lost to full collector tables"),
            &["table"],
        )?;
        registry.register(Box::new(lost.clone()))?;
        for (table, count) in self.lost.by_table() {
            lost.with_label_values(&[table]).set(count as i64);
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Holds the current snapshot
#[derive(Debug, Default)]
pub struct Exporter {
    current: RwLock<Arc<ExportSnapshot>>,
}

impl Exporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot wholesale
    pub async fn publish(&self, snapshot: ExportSnapshot) {
        *self.current.write().await = Arc::new(snapshot);
    }

    pub async fn current(&self) -> Arc<ExportSnapshot> {
        self.current.read().await.clone()
    }

    pub async fn render(&self) -> Result<String> {
        self.current().await.render()
    }
}
