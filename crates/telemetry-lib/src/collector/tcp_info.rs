//! Socket RTT source
//!
//! Samples the kernel's per-socket `tcp_info` through `ss -tin`, which
//! prints each established connection's smoothed RTT as
//! `rtt:<srtt>/<rttvar>` in milliseconds. Every connection seen in a poll
//! becomes one acknowledgment event carrying its srtt.

use super::lifecycle::TelemetrySource;
use super::probes::{KernelEvent, TelemetryProgram};
use super::CollectorError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Upper bound on sockets replayed per poll
pub const MAX_SOCKETS_PER_POLL: usize = 10_000;

const SS_ARGS: [&str; 3] = ["-tin", "state", "established"];

/// Collector source sampling socket RTTs
pub struct TcpInfoSource {
    program: PathBuf,
    args: Vec<String>,
    poll_interval: Duration,
}

impl TcpInfoSource {
    /// Sample with `ss` found at `ss_path`
    pub fn new(ss_path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self::with_command(ss_path, SS_ARGS.iter().map(|a| a.to_string()), poll_interval)
    }

    /// Sample with any command printing `ss -tin` style output
    pub fn with_command(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            poll_interval,
        }
    }

    /// Smoothed RTTs in milliseconds, one per connection
    pub fn parse_rtts_ms(output: &str) -> Vec<f64> {
        output
            .split_whitespace()
            .filter_map(|token| token.strip_prefix("rtt:"))
            .filter_map(|value| value.split('/').next()?.parse::<f64>().ok())
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .collect()
    }

    /// Milliseconds to kernel srtt units (microseconds shifted left by 3)
    pub fn ms_to_srtt(ms: f64) -> u32 {
        let micros = (ms * 1000.0).round().min(f64::from(u32::MAX >> 3));
        (micros as u32) << 3
    }

    async fn sample(&self) -> Result<Vec<f64>, CollectorError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| {
                CollectorError::Source(format!("cannot run {}: {}", self.program.display(), e))
            })?;
        if !output.status.success() {
            return Err(CollectorError::Source(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }
        Ok(Self::parse_rtts_ms(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Feed one poll's RTTs through the acknowledgment handler
    pub fn replay(program: &TelemetryProgram, rtts_ms: &[f64]) {
        let now = program.now_ns();

        if rtts_ms.len() > MAX_SOCKETS_PER_POLL {
            program
                .maps()
                .lost
                .source_overflow
                .fetch_add((rtts_ms.len() - MAX_SOCKETS_PER_POLL) as u64, Ordering::Relaxed);
        }
        for ms in rtts_ms.iter().take(MAX_SOCKETS_PER_POLL) {
            program.handle(&KernelEvent::TcpAck {
                srtt: Self::ms_to_srtt(*ms),
                timestamp_ns: now,
            });
        }
    }
}

#[async_trait]
impl TelemetrySource for TcpInfoSource {
    fn name(&self) -> &'static str {
        "tcp_info"
    }

    async fn probe(&self) -> Result<(), CollectorError> {
        if self.poll_interval.is_zero() {
            return Err(CollectorError::Attach(
                "tcp_info poll interval must be positive".to_string(),
            ));
        }
        self.sample()
            .await
            .map(|_| ())
            .map_err(|e| CollectorError::Attach(e.to_string()))
    }

    async fn run(
        self: Box<Self>,
        program: Arc<TelemetryProgram>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CollectorError> {
        info!(
            command = %self.program.display(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "Starting tcp_info telemetry source"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sample().await {
                    Ok(rtts) => {
                        debug!(sockets = rtts.len(), "tcp_info poll");
                        Self::replay(&program, &rtts);
                    }
                    Err(e) => warn!(error = %e, "tcp_info poll failed"),
                },
                _ = shutdown.recv() => {
                    info!("Stopping tcp_info telemetry source");
                    return Ok(());
                }
            }
        }
    }
}
