//! Metrics agent loop
//!
//! Alternates bounded polling of the diagnostic event stream with a
//! fixed-interval export cycle that reads the authoritative aggregates.
//! The poll is the only place the loop waits, and its timeout keeps the
//! export on schedule no matter how busy the stream is.

use super::cpu::CpuSampler;
use super::export::{ExportSnapshot, Exporter, NodeExport};
use super::percentile::percentile;
use super::rate::RateTracker;
use crate::collector::{NodeRecord, TelemetryMaps};
use crate::health::{components, HealthRegistry};
use crate::models::{NodeId, TelemetryEvent};
use crate::observability::{AgentMetrics, StructuredLogger};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// Name exported for the local node
    pub node_name: String,
    pub local_node: NodeId,
    pub export_interval: Duration,
    /// Upper bound on one wait for diagnostic events
    pub poll_timeout: Duration,
    /// Events drained per wake-up before yielding back to the loop
    pub poll_batch: usize,
    pub proc_root: PathBuf,
}

impl AgentLoopConfig {
    pub fn new(node_name: impl Into<String>, local_node: NodeId) -> Self {
        Self {
            node_name: node_name.into(),
            local_node,
            export_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(100),
            poll_batch: 256,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

#[derive(Debug, Default)]
struct NodeRates {
    retransmits: RateTracker,
    drops: RateTracker,
}

/// Turns collector state into exported gauges
pub struct MetricsAgent {
    config: AgentLoopConfig,
    maps: Arc<TelemetryMaps>,
    events: mpsc::Receiver<TelemetryEvent>,
    events_open: bool,
    exporter: Arc<Exporter>,
    cpu: CpuSampler,
    rates: HashMap<NodeId, NodeRates>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl MetricsAgent {
    pub fn new(
        config: AgentLoopConfig,
        maps: Arc<TelemetryMaps>,
        events: mpsc::Receiver<TelemetryEvent>,
        exporter: Arc<Exporter>,
        health: HealthRegistry,
    ) -> Self {
        let cpu = CpuSampler::new(&config.proc_root);
        let logger = StructuredLogger::new(health.service(), &config.node_name);
        Self {
            config,
            maps,
            events,
            events_open: true,
            exporter,
            cpu,
            rates: HashMap::new(),
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Exported node label: the configured name for the local node,
    /// `node-<id>` for any other
    pub fn node_label(&self, id: NodeId) -> String {
        if id == self.config.local_node {
            self.config.node_name.clone()
        } else {
            format!("node-{}", id)
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            export_interval_secs = self.config.export_interval.as_secs_f64(),
            poll_timeout_ms = self.config.poll_timeout.as_millis() as u64,
            "Starting metrics agent loop"
        );

        let mut ticker = interval(self.config.export_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Shutting down metrics agent loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.export_cycle().await;
                }
                polled = timeout(self.config.poll_timeout, self.events.recv()), if self.events_open => {
                    match polled {
                        Ok(Some(event)) => self.drain(event),
                        Ok(None) => self.on_stream_closed().await,
                        // Timed out; nothing to see this round
                        Err(_) => {}
                    }
                }
            }
        }
    }

    fn drain(&mut self, first: TelemetryEvent) {
        self.on_event(&first);
        for _ in 1..self.config.poll_batch {
            match self.events.try_recv() {
                Ok(event) => self.on_event(&event),
                Err(_) => break,
            }
        }
    }

    fn on_event(&self, event: &TelemetryEvent) {
        self.metrics.inc_diagnostic_event(event.kind.as_str());
        debug!(
            node_id = %event.node_id,
            kind = event.kind.as_str(),
            value = event.value,
            reason = event.reason,
            timestamp_ns = event.timestamp_ns,
            "Diagnostic event"
        );
    }

    async fn on_stream_closed(&mut self) {
        self.events_open = false;
        warn!("Diagnostic event stream closed; continuing to export aggregates");
        self.health
            .set_unhealthy(components::EVENT_STREAM, "diagnostic event stream closed")
            .await;
    }

    /// Build, publish and return one export snapshot
    pub async fn export_cycle(&mut self) -> ExportSnapshot {
        self.export_cycle_at(Instant::now()).await
    }

    pub(crate) async fn export_cycle_at(&mut self, at: Instant) -> ExportSnapshot {
        let started = Instant::now();

        let evicted = self.maps.wakeups.evict_expired(self.maps.now_ns());
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted stale wake-up entries");
        }

        let cpu = match self.cpu.sample().await {
            Ok(util) => Some(util),
            Err(e) => {
                warn!(error = %e, "Failed to sample CPU utilization");
                self.metrics.inc_cpu_sample_errors();
                None
            }
        };

        let mut records: Vec<(u32, &NodeRecord)> = self.maps.nodes.iter().collect();
        records.sort_unstable_by_key(|(id, _)| *id);

        let mut totals = [0u64; 4];
        let mut nodes = Vec::with_capacity(records.len());
        for (id, record) in records {
            let id = NodeId(id);
            let agg = record.aggregate.snapshot();
            totals[0] += agg.rtt_count;
            totals[1] += agg.retrans_count;
            totals[2] += agg.drop_count;
            totals[3] += agg.runqlat_count;

            let rtt = record.rtt_hist.snapshot();
            let runqlat = record.runqlat_hist.snapshot();
            let runqlat_p95_ms = if runqlat.is_empty() {
                agg.runqlat_mean_ms()
            } else {
                percentile(&runqlat, 95.0) as f64
            };

            let rates = self.rates.entry(id).or_default();
            let retrans_rate = rates.retransmits.observe(agg.retrans_count, at);
            let drop_rate = rates.drops.observe(agg.drop_count, at);

            nodes.push(NodeExport {
                node: self.node_label(id),
                rtt_p50_ms: percentile(&rtt, 50.0) as f64,
                rtt_p99_ms: percentile(&rtt, 99.0) as f64,
                retrans_rate,
                drop_rate,
                runqlat_p95_ms,
                cpu_utilization: None,
            });
        }

        // The local node is exported even before it has seen an event
        let local = self.node_label(self.config.local_node);
        match nodes.iter_mut().find(|n| n.node == local) {
            Some(node) => node.cpu_utilization = cpu,
            None if cpu.is_some() => nodes.push(NodeExport {
                node: local,
                cpu_utilization: cpu,
                ..Default::default()
            }),
            None => {}
        }

        let lost = self.maps.lost.snapshot();
        let snapshot = ExportSnapshot {
            nodes,
            drop_reasons: self.maps.drop_reasons(),
            lost,
            generated_at: Utc::now(),
        };
        self.exporter.publish(snapshot.clone()).await;

        for (kind, total) in ["rtt", "retransmit", "drop", "runqueue_latency"]
            .into_iter()
            .zip(totals)
        {
            self.metrics.set_events_processed(kind, total);
        }
        for (table, count) in lost.by_table() {
            self.metrics.set_events_lost(table, count);
        }
        self.metrics.set_wakeups_evicted(self.maps.wakeups.evicted());
        self.metrics.set_nodes_tracked(self.maps.nodes.len());

        let elapsed = started.elapsed();
        self.metrics.observe_export_latency(elapsed);
        let lost_total = lost.by_table().iter().map(|(_, c)| c).sum();
        self.logger
            .log_export_cycle(snapshot.nodes.len(), lost_total, elapsed);

        if cpu.is_some() {
            self.health.set_healthy(components::EXPORTER).await;
        } else {
            self.health
                .set_degraded(components::EXPORTER, "CPU counters unavailable")
                .await;
        }

        snapshot
    }
}
