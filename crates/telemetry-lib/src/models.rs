//! Core data models shared by the collector, the metrics agent and the scorer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of log2 buckets in every kernel-facing histogram
pub const HISTOGRAM_SLOTS: usize = 64;

/// Stable integer identity of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a diagnostic event; discriminants are the stream's wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EventKind {
    Rtt = 1,
    Retransmit = 2,
    Drop = 3,
    RunqueueLatency = 4,
}

impl EventKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(EventKind::Rtt),
            2 => Some(EventKind::Retransmit),
            3 => Some(EventKind::Drop),
            4 => Some(EventKind::RunqueueLatency),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Rtt => "rtt",
            EventKind::Retransmit => "retransmit",
            EventKind::Drop => "drop",
            EventKind::RunqueueLatency => "runqueue_latency",
        }
    }
}

/// Sampled event mirrored from the hot path onto the diagnostic stream.
///
/// Diagnostic only: the authoritative aggregates never read these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub node_id: NodeId,
    pub kind: EventKind,
    pub value: u64,
    pub timestamp_ns: u64,
    /// Auxiliary code, e.g. the kernel drop reason
    pub reason: u32,
}

/// The five live series the scorer ranks nodes by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringSeries {
    RttP99,
    RetransRate,
    DropRate,
    RunqlatP95,
    CpuUtil,
}

impl ScoringSeries {
    pub const ALL: [ScoringSeries; 5] = [
        ScoringSeries::RttP99,
        ScoringSeries::RetransRate,
        ScoringSeries::DropRate,
        ScoringSeries::RunqlatP95,
        ScoringSeries::CpuUtil,
    ];

    /// Exported gauge name, also the metrics-store query for the series
    pub fn metric_name(self) -> &'static str {
        match self {
            ScoringSeries::RttP99 => "ebpf_rtt_p99_milliseconds",
            ScoringSeries::RetransRate => "ebpf_tcp_retrans_rate",
            ScoringSeries::DropRate => "ebpf_drop_rate",
            ScoringSeries::RunqlatP95 => "ebpf_runqlat_p95_milliseconds",
            ScoringSeries::CpuUtil => "ebpf_cpu_utilization",
        }
    }
}

/// Raw values of the five scoring series for one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub rtt_p99_ms: f64,
    pub retrans_rate: f64,
    pub drop_rate: f64,
    pub runqlat_p95_ms: f64,
    pub cpu_util: f64,
}

impl NodeMetrics {
    pub fn get(&self, series: ScoringSeries) -> f64 {
        match series {
            ScoringSeries::RttP99 => self.rtt_p99_ms,
            ScoringSeries::RetransRate => self.retrans_rate,
            ScoringSeries::DropRate => self.drop_rate,
            ScoringSeries::RunqlatP95 => self.runqlat_p95_ms,
            ScoringSeries::CpuUtil => self.cpu_util,
        }
    }

    pub fn set(&mut self, series: ScoringSeries, value: f64) {
        match series {
            ScoringSeries::RttP99 => self.rtt_p99_ms = value,
            ScoringSeries::RetransRate => self.retrans_rate = value,
            ScoringSeries::DropRate => self.drop_rate = value,
            ScoringSeries::RunqlatP95 => self.runqlat_p95_ms = value,
            ScoringSeries::CpuUtil => self.cpu_util = value,
        }
    }
}

/// Cached score of one node, replaced wholesale on every cache refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScoreEntry {
    pub node_name: String,
    pub raw: NodeMetrics,
    /// Per-metric normalized value in [0,1], higher is better
    pub normalized: NodeMetrics,
    /// Composite score in [0,100]
    pub score: f64,
    pub cached_at: DateTime<Utc>,
}
