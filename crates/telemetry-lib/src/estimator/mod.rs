//! Percentile estimator and metrics agent
//!
//! Converts the collector's cumulative aggregates and histograms into the
//! gauges the scorer ranks nodes by: RTT percentiles, retransmission and
//! drop rates, runqueue latency p95 and CPU utilization.

mod agent_loop;
mod cpu;
mod export;
mod percentile;
mod rate;

pub use agent_loop::{AgentLoopConfig, MetricsAgent};
pub use cpu::{utilization, CpuSampler, CpuTimes};
pub use export::{
    ExportSnapshot, ExportedSample, Exporter, NodeExport, CPU_UTILIZATION, DROP_RATE,
    DROP_REASON_TOTAL, EVENTS_LOST, RETRANS_RATE, RTT_P50, RTT_P99, RUNQLAT_P95,
};
pub use percentile::{bucket_floor, percentile, percentile_of_slots};
pub use rate::RateTracker;
