//! Procfs-backed telemetry source
//!
//! Derives collector events from cumulative kernel counters:
//! - /proc/net/snmp `Tcp: RetransSegs` for retransmissions
//! - /proc/net/dev rx/tx drop columns for packet drops (reason unspecified)
//! - /proc/schedstat run delay and timeslices for runqueue latency
//!
//! Procfs exposes no per-segment RTT, so this source never emits RTT
//! samples; those come from a probe-backed source.

use super::lifecycle::TelemetrySource;
use super::probes::{KernelEvent, TelemetryProgram};
use super::CollectorError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Drop reason recorded for drops whose cause procfs does not report
pub const DROP_REASON_UNSPECIFIED: u32 = 0;

/// Upper bound on events replayed from one counter delta per poll
pub const MAX_EVENTS_PER_POLL: u64 = 100_000;

/// Per-CPU scheduler counters from /proc/schedstat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSchedStat {
    pub run_delay_ns: u64,
    pub timeslices: u64,
}

/// One reading of all counters the source follows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcSample {
    pub retrans_segs: Option<u64>,
    pub dev_drops: Option<u64>,
    pub sched: HashMap<String, CpuSchedStat>,
}

/// Work derived from two consecutive samples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcDelta {
    pub retransmits: u64,
    pub drops: u64,
    /// Mean runqueue wait per timeslice, one entry per CPU that ran
    pub runqueue_latencies_ns: Vec<u64>,
}

/// Collector source polling procfs counters
pub struct ProcfsSource {
    proc_root: PathBuf,
    poll_interval: Duration,
}

impl ProcfsSource {
    pub fn new(proc_root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            proc_root: proc_root.into(),
            poll_interval,
        }
    }

    /// Parse `RetransSegs` from /proc/net/snmp contents
    pub fn parse_retrans_segs(content: &str) -> Option<u64> {
        let mut tcp_lines = content.lines().filter(|l| l.starts_with("Tcp:"));
        let header = tcp_lines.next()?;
        let values = tcp_lines.next()?;

        let idx = header
            .split_whitespace()
            .position(|field| field == "RetransSegs")?;
        values.split_whitespace().nth(idx)?.parse().ok()
    }

    /// Sum rx and tx drops over all non-loopback interfaces in /proc/net/dev
    pub fn parse_dev_drops(content: &str) -> u64 {
        content
            .lines()
            .filter_map(|line| line.split_once(':'))
            .filter(|(iface, _)| iface.trim() != "lo")
            .filter_map(|(_, stats)| {
                let fields: Vec<&str> = stats.split_whitespace().collect();
                if fields.len() < 12 {
                    return None;
                }
                let rx: u64 = fields[3].parse().ok()?;
                let tx: u64 = fields[11].parse().ok()?;
                Some(rx + tx)
            })
            .sum()
    }

    /// Parse per-CPU lines of /proc/schedstat
    pub fn parse_schedstat(content: &str) -> HashMap<String, CpuSchedStat> {
        let mut stats = HashMap::new();

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 || !parts[0].starts_with("cpu") {
                continue;
            }
            // cpuN yld legacy sched goidle ttwu ttwu_local rq_cpu_time run_delay pcount
            if let (Ok(run_delay_ns), Ok(timeslices)) = (parts[8].parse(), parts[9].parse()) {
                stats.insert(
                    parts[0].to_string(),
                    CpuSchedStat {
                        run_delay_ns,
                        timeslices,
                    },
                );
            }
        }

        stats
    }

    /// Read every counter; missing files leave their field empty
    pub async fn read_sample(&self) -> ProcSample {
        let snmp = fs::read_to_string(self.proc_root.join("net/snmp"))
            .await
            .unwrap_or_default();
        let dev = fs::read_to_string(self.proc_root.join("net/dev")).await.ok();
        let schedstat = fs::read_to_string(self.proc_root.join("schedstat"))
            .await
            .unwrap_or_default();

        ProcSample {
            retrans_segs: Self::parse_retrans_segs(&snmp),
            dev_drops: dev.as_deref().map(Self::parse_dev_drops),
            sched: Self::parse_schedstat(&schedstat),
        }
    }

    /// Events implied by moving from `prev` to `next`. Counters that went
    /// backwards are treated as reset and contribute nothing.
    pub fn delta(prev: &ProcSample, next: &ProcSample) -> ProcDelta {
        let counter = |a: Option<u64>, b: Option<u64>| match (a, b) {
            (Some(a), Some(b)) if b >= a => b - a,
            _ => 0,
        };

        let mut runqueue_latencies_ns: Vec<u64> = next
            .sched
            .iter()
            .filter_map(|(cpu, now)| {
                let before = prev.sched.get(cpu)?;
                let slices = now.timeslices.checked_sub(before.timeslices)?;
                let delay = now.run_delay_ns.checked_sub(before.run_delay_ns)?;
                (slices > 0).then(|| delay / slices)
            })
            .collect();
        runqueue_latencies_ns.sort_unstable();

        ProcDelta {
            retransmits: counter(prev.retrans_segs, next.retrans_segs),
            drops: counter(prev.dev_drops, next.dev_drops),
            runqueue_latencies_ns,
        }
    }

    fn replay(program: &TelemetryProgram, delta: &ProcDelta) {
        let now = program.now_ns();

        let overflow = delta.retransmits.saturating_sub(MAX_EVENTS_PER_POLL)
            + delta.drops.saturating_sub(MAX_EVENTS_PER_POLL);
        if overflow > 0 {
            program
                .maps()
                .lost
                .source_overflow
                .fetch_add(overflow, Ordering::Relaxed);
        }

        for _ in 0..delta.retransmits.min(MAX_EVENTS_PER_POLL) {
            program.handle(&KernelEvent::Retransmit { timestamp_ns: now });
        }
        for _ in 0..delta.drops.min(MAX_EVENTS_PER_POLL) {
            program.handle(&KernelEvent::Drop {
                reason: DROP_REASON_UNSPECIFIED,
                timestamp_ns: now,
            });
        }
        for latency_ns in &delta.runqueue_latencies_ns {
            program.handle(&KernelEvent::RunqueueLatency {
                latency_ns: *latency_ns,
                timestamp_ns: now,
            });
        }
    }
}

#[async_trait]
impl TelemetrySource for ProcfsSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    async fn probe(&self) -> Result<(), CollectorError> {
        if self.poll_interval.is_zero() {
            return Err(CollectorError::Attach(
                "procfs poll interval must be positive".to_string(),
            ));
        }

        let snmp_path = self.proc_root.join("net/snmp");
        let snmp = fs::read_to_string(&snmp_path).await.map_err(|e| {
            CollectorError::Attach(format!("cannot read {}: {}", snmp_path.display(), e))
        })?;
        if Self::parse_retrans_segs(&snmp).is_none() {
            return Err(CollectorError::Attach(format!(
                "no Tcp RetransSegs counter in {}",
                snmp_path.display()
            )));
        }

        for optional in ["net/dev", "schedstat"] {
            let path = self.proc_root.join(optional);
            if fs::metadata(&path).await.is_err() {
                warn!(path = %path.display(), "Optional procfs counter unavailable");
            }
        }
        Ok(())
    }

    async fn run(
        self: Box<Self>,
        program: Arc<TelemetryProgram>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CollectorError> {
        info!(
            proc_root = %self.proc_root.display(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "Starting procfs telemetry source"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous: Option<ProcSample> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = self.read_sample().await;
                    if let Some(prev) = &previous {
                        let delta = Self::delta(prev, &sample);
                        debug!(
                            retransmits = delta.retransmits,
                            drops = delta.drops,
                            cpus = delta.runqueue_latencies_ns.len(),
                            "Procfs poll"
                        );
                        Self::replay(&program, &delta);
                    }
                    previous = Some(sample);
                }
                _ = shutdown.recv() => {
                    info!("Stopping procfs telemetry source");
                    return Ok(());
                }
            }
        }
    }
}
