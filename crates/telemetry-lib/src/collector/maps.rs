//! Collector-resident shared state
//!
//! Mirrors the fixed-size maps an in-kernel collector keeps: a per-node
//! table of aggregates and histograms, a drop-reason table and a
//! wake-up timestamp table. Every mutation on the event path is a single
//! atomic operation; nothing here takes a lock.

use super::histogram::Log2Histogram;
use crate::models::NodeId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Default node table capacity
pub const MAX_NODES: usize = 256;

/// Default drop reason table capacity
pub const MAX_DROP_REASONS: usize = 64;

/// Default number of wake-up slots
pub const WAKEUP_SLOTS: usize = 8192;

const EMPTY_KEY: u32 = u32::MAX;

/// Fixed-capacity, insert-only hash table.
///
/// Keys are claimed with a single compare-and-swap and values are
/// pre-allocated, so a claimed slot is usable the moment the claim
/// succeeds. When every slot is taken, inserts fail instead of growing.
#[derive(Debug)]
pub struct FixedTable<V> {
    keys: Box<[AtomicU32]>,
    values: Box<[V]>,
    len: AtomicUsize,
}

impl<V: Default> FixedTable<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            keys: (0..capacity).map(|_| AtomicU32::new(EMPTY_KEY)).collect(),
            values: (0..capacity).map(|_| V::default()).collect(),
            len: AtomicUsize::new(0),
        }
    }
}

impl<V> FixedTable<V> {
    fn start(&self, key: u32) -> usize {
        key.wrapping_mul(0x9E37_79B9) as usize % self.keys.len()
    }

    pub fn get(&self, key: u32) -> Option<&V> {
        let cap = self.keys.len();
        let start = self.start(key);
        for i in 0..cap {
            let idx = (start + i) % cap;
            match self.keys[idx].load(Ordering::Acquire) {
                k if k == key => return Some(&self.values[idx]),
                EMPTY_KEY => return None,
                _ => {}
            }
        }
        None
    }

    /// Look up `key`, claiming a slot on first touch. `None` means the
    /// table is full (or the key is the reserved sentinel).
    pub fn get_or_insert(&self, key: u32) -> Option<&V> {
        if key == EMPTY_KEY {
            return None;
        }
        let cap = self.keys.len();
        let start = self.start(key);
        for i in 0..cap {
            let idx = (start + i) % cap;
            let current = self.keys[idx].load(Ordering::Acquire);
            if current == key {
                return Some(&self.values[idx]);
            }
            if current != EMPTY_KEY {
                continue;
            }
            match self.keys[idx].compare_exchange(
                EMPTY_KEY,
                key,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return Some(&self.values[idx]);
                }
                Err(actual) if actual == key => return Some(&self.values[idx]),
                Err(_) => continue,
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> {
        self.keys
            .iter()
            .zip(self.values.iter())
            .filter_map(|(k, v)| match k.load(Ordering::Acquire) {
                EMPTY_KEY => None,
                key => Some((key, v)),
            })
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.keys.len()
    }
}

/// Cumulative per-node counters; only ever increase
#[derive(Debug, Default)]
pub struct NodeAggregate {
    pub rtt_sum: AtomicU64,
    pub rtt_count: AtomicU64,
    pub retrans_count: AtomicU64,
    pub drop_count: AtomicU64,
    pub runqlat_sum: AtomicU64,
    pub runqlat_count: AtomicU64,
    pub last_update_ns: AtomicU64,
}

impl NodeAggregate {
    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            rtt_sum: self.rtt_sum.load(Ordering::Relaxed),
            rtt_count: self.rtt_count.load(Ordering::Relaxed),
            retrans_count: self.retrans_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            runqlat_sum: self.runqlat_sum.load(Ordering::Relaxed),
            runqlat_count: self.runqlat_count.load(Ordering::Relaxed),
            last_update_ns: self.last_update_ns.load(Ordering::Relaxed),
        }
    }

    fn touch(&self, now_ns: u64) {
        self.last_update_ns.store(now_ns, Ordering::Relaxed);
    }
}

/// Plain copy of a node aggregate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub rtt_sum: u64,
    pub rtt_count: u64,
    pub retrans_count: u64,
    pub drop_count: u64,
    pub runqlat_sum: u64,
    pub runqlat_count: u64,
    pub last_update_ns: u64,
}

impl AggregateSnapshot {
    pub fn rtt_mean_ms(&self) -> f64 {
        mean(self.rtt_sum, self.rtt_count)
    }

    pub fn runqlat_mean_ms(&self) -> f64 {
        mean(self.runqlat_sum, self.runqlat_count)
    }
}

fn mean(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

/// Everything the collector keeps for one node
#[derive(Debug, Default)]
pub struct NodeRecord {
    pub aggregate: NodeAggregate,
    /// RTT in milliseconds
    pub rtt_hist: Log2Histogram,
    /// Runqueue latency in milliseconds
    pub runqlat_hist: Log2Histogram,
}

impl NodeRecord {
    pub(crate) fn record_rtt(&self, rtt_ms: u64, now_ns: u64) {
        self.rtt_hist.record(rtt_ms);
        self.aggregate.rtt_sum.fetch_add(rtt_ms, Ordering::Relaxed);
        self.aggregate.rtt_count.fetch_add(1, Ordering::Relaxed);
        self.aggregate.touch(now_ns);
    }

    pub(crate) fn record_retransmit(&self, now_ns: u64) {
        self.aggregate.retrans_count.fetch_add(1, Ordering::Relaxed);
        self.aggregate.touch(now_ns);
    }

    pub(crate) fn record_drop(&self, now_ns: u64) {
        self.aggregate.drop_count.fetch_add(1, Ordering::Relaxed);
        self.aggregate.touch(now_ns);
    }

    pub(crate) fn record_runqlat(&self, latency_ms: u64, now_ns: u64) {
        self.runqlat_hist.record(latency_ms);
        self.aggregate.runqlat_sum.fetch_add(latency_ms, Ordering::Relaxed);
        self.aggregate.runqlat_count.fetch_add(1, Ordering::Relaxed);
        self.aggregate.touch(now_ns);
    }
}

/// Direct-mapped `pid -> wake-up timestamp` table.
///
/// Memory is fixed by construction: colliding pids overwrite each other
/// and a wake-up that is never paired is discarded once it is older than
/// the TTL, either at dispatch or by [`WakeupTable::evict_expired`].
#[derive(Debug)]
pub struct WakeupTable {
    pids: Box<[AtomicU32]>,
    /// 0 marks an empty slot
    stamps: Box<[AtomicU64]>,
    ttl_ns: u64,
    evicted: AtomicU64,
}

impl WakeupTable {
    pub fn new(slots: usize, ttl: Duration) -> Self {
        let slots = slots.max(1);
        Self {
            pids: (0..slots).map(|_| AtomicU32::new(0)).collect(),
            stamps: (0..slots).map(|_| AtomicU64::new(0)).collect(),
            ttl_ns: ttl.as_nanos().min(u64::MAX as u128) as u64,
            evicted: AtomicU64::new(0),
        }
    }

    fn slot(&self, pid: u32) -> usize {
        pid as usize % self.pids.len()
    }

    pub fn record(&self, pid: u32, now_ns: u64) {
        let idx = self.slot(pid);
        self.stamps[idx].store(0, Ordering::Release);
        self.pids[idx].store(pid, Ordering::Release);
        self.stamps[idx].store(now_ns.max(1), Ordering::Release);
    }

    /// Consume the wake-up for `pid`, returning the elapsed nanoseconds
    pub fn take(&self, pid: u32, now_ns: u64) -> Option<u64> {
        let idx = self.slot(pid);
        if self.pids[idx].load(Ordering::Acquire) != pid {
            return None;
        }
        let stamp = self.stamps[idx].swap(0, Ordering::AcqRel);
        if stamp == 0 || now_ns < stamp {
            return None;
        }
        let elapsed = now_ns - stamp;
        if elapsed > self.ttl_ns {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(elapsed)
    }

    /// Clear every wake-up older than the TTL; returns how many were cleared
    pub fn evict_expired(&self, now_ns: u64) -> u64 {
        let mut cleared = 0;
        for stamp in self.stamps.iter() {
            let ts = stamp.load(Ordering::Acquire);
            if ts != 0
                && now_ns.saturating_sub(ts) > self.ttl_ns
                && stamp
                    .compare_exchange(ts, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                cleared += 1;
            }
        }
        self.evicted.fetch_add(cleared, Ordering::Relaxed);
        cleared
    }

    pub fn occupied(&self) -> usize {
        self.stamps
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != 0)
            .count()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Counters for contributions the collector had to give up on
#[derive(Debug, Default)]
pub struct LossCounters {
    pub node_table_full: AtomicU64,
    pub reason_table_full: AtomicU64,
    pub ring_full: AtomicU64,
    pub source_overflow: AtomicU64,
}

impl LossCounters {
    pub fn snapshot(&self) -> LossSnapshot {
        LossSnapshot {
            node_table_full: self.node_table_full.load(Ordering::Relaxed),
            reason_table_full: self.reason_table_full.load(Ordering::Relaxed),
            ring_full: self.ring_full.load(Ordering::Relaxed),
            source_overflow: self.source_overflow.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossSnapshot {
    pub node_table_full: u64,
    pub reason_table_full: u64,
    pub ring_full: u64,
    pub source_overflow: u64,
}

impl LossSnapshot {
    /// `(table label, count)` pairs as exported
    pub fn by_table(&self) -> [(&'static str, u64); 4] {
        [
            ("nodes", self.node_table_full),
            ("drop_reasons", self.reason_table_full),
            ("events", self.ring_full),
            ("source", self.source_overflow),
        ]
    }
}

/// Sizing of the collector maps
#[derive(Debug, Clone)]
pub struct MapsConfig {
    pub max_nodes: usize,
    pub max_drop_reasons: usize,
    pub wakeup_slots: usize,
    pub wakeup_ttl: Duration,
}

impl Default for MapsConfig {
    fn default() -> Self {
        Self {
            max_nodes: MAX_NODES,
            max_drop_reasons: MAX_DROP_REASONS,
            wakeup_slots: WAKEUP_SLOTS,
            wakeup_ttl: Duration::from_secs(5),
        }
    }
}

/// All collector state, owned by one attach/detach cycle
#[derive(Debug)]
pub struct TelemetryMaps {
    pub nodes: FixedTable<NodeRecord>,
    pub drop_reasons: FixedTable<AtomicU64>,
    pub wakeups: WakeupTable,
    pub lost: LossCounters,
    epoch: Instant,
}

impl TelemetryMaps {
    pub fn new(config: &MapsConfig) -> Self {
        Self {
            nodes: FixedTable::with_capacity(config.max_nodes),
            drop_reasons: FixedTable::with_capacity(config.max_drop_reasons),
            wakeups: WakeupTable::new(config.wakeup_slots, config.wakeup_ttl),
            lost: LossCounters::default(),
            epoch: Instant::now(),
        }
    }

    /// Monotonic nanoseconds since the maps were created
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos().min(u64::MAX as u128) as u64
    }

    /// Record for `node`, allocated on first touch; a full table counts
    /// the contribution as lost.
    pub fn node(&self, node: NodeId) -> Option<&NodeRecord> {
        let record = self.nodes.get_or_insert(node.0);
        if record.is_none() {
            self.lost.node_table_full.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    pub fn count_drop_reason(&self, reason: u32) {
        match self.drop_reasons.get_or_insert(reason) {
            Some(count) => {
                count.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.lost.reason_table_full.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// `(reason, count)` pairs sorted by reason
    pub fn drop_reasons(&self) -> Vec<(u32, u64)> {
        let mut reasons: Vec<_> = self
            .drop_reasons
            .iter()
            .map(|(reason, count)| (reason, count.load(Ordering::Relaxed)))
            .collect();
        reasons.sort_unstable_by_key(|(reason, _)| *reason);
        reasons
    }

    /// Node ids present in the table, sorted
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.iter().map(|(id, _)| NodeId(id)).collect();
        ids.sort_unstable();
        ids
    }
}
