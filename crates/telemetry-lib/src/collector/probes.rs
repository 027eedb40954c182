//! Event handlers run on the collector's hot path
//!
//! Each handler updates the authoritative aggregates unconditionally and
//! then, subject to the sampling policy, mirrors the event onto the
//! diagnostic stream. Sampling never touches the aggregates.

use super::maps::TelemetryMaps;
use crate::models::{EventKind, NodeId, TelemetryEvent};
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Raw event as delivered by an instrumentation source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelEvent {
    /// Acknowledgment processed; `srtt` is the smoothed RTT in kernel
    /// units (microseconds shifted left by 3)
    TcpAck { srtt: u32, timestamp_ns: u64 },
    Retransmit { timestamp_ns: u64 },
    Drop { reason: u32, timestamp_ns: u64 },
    SchedWakeup { pid: u32, timestamp_ns: u64 },
    SchedSwitch { next_pid: u32, timestamp_ns: u64 },
    /// Pre-paired runqueue latency, for sources that observe it directly
    RunqueueLatency { latency_ns: u64, timestamp_ns: u64 },
}

/// Convert a kernel smoothed RTT to whole milliseconds
pub fn srtt_to_ms(srtt: u32) -> u64 {
    u64::from(srtt >> 3) / 1000
}

/// Decides whether an event is mirrored to the diagnostic stream
pub trait Sampler: Send + Sync {
    /// True with probability `1 / one_in`
    fn hit(&self, one_in: u32) -> bool;
}

/// Uniform random sampling from a thread-local generator
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn hit(&self, one_in: u32) -> bool {
        one_in <= 1 || rand::thread_rng().gen_range(0..one_in) == 0
    }
}

/// Diagnostic stream density per event kind, as "one in N"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPolicy {
    pub rtt_one_in: u32,
    pub retransmit_one_in: u32,
    pub drop_one_in: u32,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            rtt_one_in: 100,
            retransmit_one_in: 1,
            drop_one_in: 10,
        }
    }
}

/// The collector program: handlers bound to one set of maps and one
/// diagnostic ring
pub struct TelemetryProgram {
    maps: Arc<TelemetryMaps>,
    ring: mpsc::Sender<TelemetryEvent>,
    sampler: Box<dyn Sampler>,
    policy: SamplingPolicy,
    local_node: NodeId,
}

impl TelemetryProgram {
    pub fn new(
        maps: Arc<TelemetryMaps>,
        ring: mpsc::Sender<TelemetryEvent>,
        local_node: NodeId,
        policy: SamplingPolicy,
    ) -> Self {
        Self::with_sampler(maps, ring, local_node, policy, Box::new(RandomSampler))
    }

    pub fn with_sampler(
        maps: Arc<TelemetryMaps>,
        ring: mpsc::Sender<TelemetryEvent>,
        local_node: NodeId,
        policy: SamplingPolicy,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        Self {
            maps,
            ring,
            sampler,
            policy,
            local_node,
        }
    }

    pub fn maps(&self) -> &Arc<TelemetryMaps> {
        &self.maps
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn now_ns(&self) -> u64 {
        self.maps.now_ns()
    }

    /// Dispatch a raw event, attributing it to the local node
    pub fn handle(&self, event: &KernelEvent) {
        let node = self.local_node;
        match *event {
            KernelEvent::TcpAck { srtt, timestamp_ns } => self.on_tcp_ack(node, srtt, timestamp_ns),
            KernelEvent::Retransmit { timestamp_ns } => self.on_retransmit(node, timestamp_ns),
            KernelEvent::Drop {
                reason,
                timestamp_ns,
            } => self.on_drop(node, reason, timestamp_ns),
            KernelEvent::SchedWakeup { pid, timestamp_ns } => {
                self.on_sched_wakeup(pid, timestamp_ns)
            }
            KernelEvent::SchedSwitch {
                next_pid,
                timestamp_ns,
            } => self.on_sched_switch(node, next_pid, timestamp_ns),
            KernelEvent::RunqueueLatency {
                latency_ns,
                timestamp_ns,
            } => self.on_runqueue_latency(node, latency_ns, timestamp_ns),
        }
    }

    pub fn on_tcp_ack(&self, node: NodeId, srtt: u32, now_ns: u64) {
        let rtt_ms = srtt_to_ms(srtt);
        let Some(record) = self.maps.node(node) else {
            return;
        };
        record.record_rtt(rtt_ms, now_ns);

        if self.sampler.hit(self.policy.rtt_one_in) {
            self.emit(node, EventKind::Rtt, rtt_ms, now_ns, 0);
        }
    }

    pub fn on_retransmit(&self, node: NodeId, now_ns: u64) {
        let Some(record) = self.maps.node(node) else {
            return;
        };
        record.record_retransmit(now_ns);

        if self.sampler.hit(self.policy.retransmit_one_in) {
            self.emit(node, EventKind::Retransmit, 1, now_ns, 0);
        }
    }

    pub fn on_drop(&self, node: NodeId, reason: u32, now_ns: u64) {
        // The reason table is keyed independently of the node table
        self.maps.count_drop_reason(reason);

        let Some(record) = self.maps.node(node) else {
            return;
        };
        record.record_drop(now_ns);

        if self.sampler.hit(self.policy.drop_one_in) {
            self.emit(node, EventKind::Drop, 1, now_ns, reason);
        }
    }

    pub fn on_sched_wakeup(&self, pid: u32, now_ns: u64) {
        self.maps.wakeups.record(pid, now_ns);
    }

    pub fn on_sched_switch(&self, node: NodeId, next_pid: u32, now_ns: u64) {
        if let Some(latency_ns) = self.maps.wakeups.take(next_pid, now_ns) {
            self.on_runqueue_latency(node, latency_ns, now_ns);
        }
    }

    pub fn on_runqueue_latency(&self, node: NodeId, latency_ns: u64, now_ns: u64) {
        let Some(record) = self.maps.node(node) else {
            return;
        };
        record.record_runqlat(latency_ns / 1_000_000, now_ns);
    }

    fn emit(&self, node: NodeId, kind: EventKind, value: u64, timestamp_ns: u64, reason: u32) {
        let event = TelemetryEvent {
            node_id: node,
            kind,
            value,
            timestamp_ns,
            reason,
        };
        if self.ring.try_send(event).is_err() {
            self.maps.lost.ring_full.fetch_add(1, Ordering::Relaxed);
        }
    }
}
