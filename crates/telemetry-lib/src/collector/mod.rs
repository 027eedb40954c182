//! Kernel telemetry collector
//!
//! This module models the in-kernel half of the pipeline: fixed-size maps
//! of per-node aggregates and log2 histograms, updated with atomic
//! fetch-and-add from non-blocking event handlers, plus a bounded
//! diagnostic event stream fed by sampling the hot path. Event sources
//! plug in through [`TelemetrySource`] and are bound to the maps by an
//! explicit attach/detach lifecycle.

mod histogram;
mod lifecycle;
mod maps;
mod probes;
mod procfs;
mod tcp_info;

#[cfg(feature = "bpf")]
mod bpf;

#[cfg(test)]
mod tests;

pub use histogram::{slot_for, HistogramSnapshot, Log2Histogram};
pub use lifecycle::{
    watch_source, ChannelSource, Collector, CollectorConfig, CollectorHandle, SourceLiveness,
    SourceSet, TelemetrySource, DEFAULT_RING_CAPACITY, SOURCE_WATCH_INTERVAL,
};
pub use maps::{
    AggregateSnapshot, FixedTable, LossCounters, LossSnapshot, MapsConfig, NodeAggregate,
    NodeRecord, TelemetryMaps, WakeupTable, MAX_DROP_REASONS, MAX_NODES, WAKEUP_SLOTS,
};
pub use probes::{
    srtt_to_ms, KernelEvent, RandomSampler, Sampler, SamplingPolicy, TelemetryProgram,
};
pub use procfs::{
    CpuSchedStat, ProcDelta, ProcSample, ProcfsSource, DROP_REASON_UNSPECIFIED,
    MAX_EVENTS_PER_POLL,
};
pub use tcp_info::{TcpInfoSource, MAX_SOCKETS_PER_POLL};

#[cfg(feature = "bpf")]
pub use bpf::{BpfSource, RawEvent, RAW_EVENT_SIZE};

use thiserror::Error;

/// Collector failures. Only attach failures are fatal to the agent.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to attach telemetry source: {0}")]
    Attach(String),

    #[error("telemetry source failed: {0}")]
    Source(String),
}
