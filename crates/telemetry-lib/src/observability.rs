//! Observability infrastructure for the agent and the extender
//!
//! Provides:
//! - Prometheus self-metrics, registered once into the default registry
//! - Structured JSON lifecycle events with tracing

use prometheus::{
    register_gauge, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder, Gauge,
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Latency buckets in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

static AGENT_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();
static EXTENDER_METRICS: OnceLock<ExtenderMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    events_processed: IntGaugeVec,
    events_lost: IntGaugeVec,
    diagnostic_events: IntCounterVec,
    wakeups_evicted: IntGauge,
    export_latency_seconds: Histogram,
    nodes_tracked: IntGauge,
    cpu_sample_errors: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            events_processed: register_int_gauge_vec!(
                "netsched_agent_events_processed",
                "Events folded into the collector aggregates, by kind",
                &["kind"]
            )
            .expect("Failed to register events_processed"),

            events_lost: register_int_gauge_vec!(
                "netsched_agent_events_lost",
                "Event contributions lost to a full collector table, by table",
                &["table"]
            )
            .expect("Failed to register events_lost"),

            diagnostic_events: register_int_counter_vec!(
                "netsched_agent_diagnostic_events_total",
                "Sampled events received on the diagnostic stream, by kind",
                &["kind"]
            )
            .expect("Failed to register diagnostic_events"),

            wakeups_evicted: register_int_gauge!(
                "netsched_agent_wakeups_evicted",
                "Unpaired wake-up entries discarded after their TTL"
            )
            .expect("Failed to register wakeups_evicted"),

            export_latency_seconds: register_histogram!(
                "netsched_agent_export_latency_seconds",
                "Time spent building one export snapshot",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register export_latency_seconds"),

            nodes_tracked: register_int_gauge!(
                "netsched_agent_nodes_tracked",
                "Nodes present in the collector node table"
            )
            .expect("Failed to register nodes_tracked"),

            cpu_sample_errors: register_int_counter!(
                "netsched_agent_cpu_sample_errors_total",
                "Failed reads of the system CPU counters"
            )
            .expect("Failed to register cpu_sample_errors"),
        }
    }
}

/// Handle to the agent's self-metrics; clones share the global instance
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        AGENT_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        AGENT_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn set_events_processed(&self, kind: &str, total: u64) {
        self.inner()
            .events_processed
            .with_label_values(&[kind])
            .set(total as i64);
    }

    pub fn set_events_lost(&self, table: &str, total: u64) {
        self.inner()
            .events_lost
            .with_label_values(&[table])
            .set(total as i64);
    }

    pub fn inc_diagnostic_event(&self, kind: &str) {
        self.inner().diagnostic_events.with_label_values(&[kind]).inc();
    }

    pub fn set_wakeups_evicted(&self, total: u64) {
        self.inner().wakeups_evicted.set(total as i64);
    }

    pub fn observe_export_latency(&self, elapsed: Duration) {
        self.inner()
            .export_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_nodes_tracked(&self, count: usize) {
        self.inner().nodes_tracked.set(count as i64);
    }

    pub fn inc_cpu_sample_errors(&self) {
        self.inner().cpu_sample_errors.inc();
    }
}

struct ExtenderMetricsInner {
    refresh_latency_seconds: Histogram,
    refresh_failures: IntCounter,
    cache_nodes: IntGauge,
    cache_age_seconds: Gauge,
    requests: IntCounterVec,
    request_latency_seconds: HistogramVec,
}

impl ExtenderMetricsInner {
    fn new() -> Self {
        Self {
            refresh_latency_seconds: register_histogram!(
                "netsched_extender_cache_refresh_latency_seconds",
                "Time spent rebuilding the score cache from the metrics store",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register refresh_latency_seconds"),

            refresh_failures: register_int_counter!(
                "netsched_extender_cache_refresh_failures_total",
                "Cache refreshes that failed or timed out"
            )
            .expect("Failed to register refresh_failures"),

            cache_nodes: register_int_gauge!(
                "netsched_extender_cache_nodes",
                "Nodes in the current score cache generation"
            )
            .expect("Failed to register cache_nodes"),

            cache_age_seconds: register_gauge!(
                "netsched_extender_cache_age_seconds",
                "Age of the current score cache generation"
            )
            .expect("Failed to register cache_age_seconds"),

            requests: register_int_counter_vec!(
                "netsched_extender_requests_total",
                "Scoring protocol requests, by endpoint and outcome",
                &["endpoint", "outcome"]
            )
            .expect("Failed to register requests"),

            request_latency_seconds: register_histogram_vec!(
                "netsched_extender_request_latency_seconds",
                "Scoring protocol request latency, by endpoint",
                &["endpoint"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register request_latency_seconds"),
        }
    }
}

/// Handle to the extender's self-metrics; clones share the global instance
#[derive(Clone)]
pub struct ExtenderMetrics {
    _private: (),
}

impl Default for ExtenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtenderMetrics {
    pub fn new() -> Self {
        EXTENDER_METRICS.get_or_init(ExtenderMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ExtenderMetricsInner {
        EXTENDER_METRICS.get_or_init(ExtenderMetricsInner::new)
    }

    pub fn observe_refresh(&self, elapsed: Duration, nodes: usize) {
        self.inner()
            .refresh_latency_seconds
            .observe(elapsed.as_secs_f64());
        self.inner().cache_nodes.set(nodes as i64);
    }

    pub fn inc_refresh_failures(&self) {
        self.inner().refresh_failures.inc();
    }

    pub fn set_cache_age(&self, age_secs: f64) {
        self.inner().cache_age_seconds.set(age_secs);
    }

    pub fn observe_request(&self, endpoint: &str, outcome: &str, elapsed: Duration) {
        self.inner()
            .requests
            .with_label_values(&[endpoint, outcome])
            .inc();
        self.inner()
            .request_latency_seconds
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }
}

/// Encode everything in the default registry in the text exposition format
pub fn gather_default_registry() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Consistent lifecycle events for both services
#[derive(Clone)]
pub struct StructuredLogger {
    service: String,
    node_name: String,
}

impl StructuredLogger {
    pub fn new(service: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            service = %self.service,
            node = %self.node_name,
            version = %version,
            "Service started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            service = %self.service,
            node = %self.node_name,
            reason = %reason,
            "Service shutting down"
        );
    }

    pub fn log_collector_attached(&self, source: &str, node_id: u32) {
        info!(
            event = "collector_attached",
            service = %self.service,
            node = %self.node_name,
            source = %source,
            node_id = node_id,
            "Telemetry collector attached"
        );
    }

    pub fn log_collector_detached(&self, source: &str, clean: bool) {
        if clean {
            info!(
                event = "collector_detached",
                service = %self.service,
                node = %self.node_name,
                source = %source,
                "Telemetry collector detached"
            );
        } else {
            warn!(
                event = "collector_detached",
                service = %self.service,
                node = %self.node_name,
                source = %source,
                "Telemetry collector detached with errors"
            );
        }
    }

    pub fn log_export_cycle(&self, nodes: usize, lost: u64, elapsed: Duration) {
        info!(
            event = "export_cycle",
            service = %self.service,
            node = %self.node_name,
            nodes = nodes,
            events_lost = lost,
            elapsed_ms = elapsed.as_millis() as u64,
            "Published export snapshot"
        );
    }

    pub fn log_cache_refreshed(&self, nodes: usize, elapsed: Duration) {
        info!(
            event = "cache_refreshed",
            service = %self.service,
            nodes = nodes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Score cache refreshed"
        );
    }

    pub fn log_cache_refresh_failed(&self, error: &str, cache_age_secs: Option<i64>) {
        warn!(
            event = "cache_refresh_failed",
            service = %self.service,
            error = %error,
            cache_age_secs = ?cache_age_secs,
            "Score cache refresh failed, serving previous cache"
        );
    }
}
