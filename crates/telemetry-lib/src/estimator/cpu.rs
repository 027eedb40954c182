//! Whole-system CPU utilization from /proc/stat

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::fs;

/// Aggregate jiffy counters from the `cpu` line of /proc/stat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

impl CpuTimes {
    /// Parse the aggregate `cpu` line: user nice system idle iowait irq softirq
    pub fn parse(content: &str) -> Option<Self> {
        let line = content.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(7)
            .map(|f| f.parse().ok())
            .collect::<Option<Vec<_>>>()?;
        if fields.len() < 7 {
            return None;
        }

        Some(Self {
            total: fields.iter().sum(),
            // idle + iowait
            idle: fields[3] + fields[4],
        })
    }

    fn busy(&self) -> u64 {
        self.total.saturating_sub(self.idle)
    }
}

/// Busy percentage between two readings; `prev = None` gives the
/// since-boot ratio
pub fn utilization(prev: Option<CpuTimes>, now: CpuTimes) -> f64 {
    let base = prev.unwrap_or_default();
    let total = now.total.saturating_sub(base.total);
    if total == 0 {
        return 0.0;
    }
    let busy = now.busy().saturating_sub(base.busy());
    (busy as f64 * 100.0 / total as f64).clamp(0.0, 100.0)
}

/// Samples CPU utilization at the caller's cadence
#[derive(Debug)]
pub struct CpuSampler {
    stat_path: PathBuf,
    previous: Option<CpuTimes>,
}

impl CpuSampler {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            stat_path: proc_root.into().join("stat"),
            previous: None,
        }
    }

    /// Utilization since the previous call, in percent
    pub async fn sample(&mut self) -> Result<f64> {
        let content = fs::read_to_string(&self.stat_path)
            .await
            .with_context(|| format!("Failed to read {}", self.stat_path.display()))?;
        let now = CpuTimes::parse(&content)
            .with_context(|| format!("No aggregate cpu line in {}", self.stat_path.display()))?;

        let util = utilization(self.previous, now);
        self.previous = Some(now);
        Ok(util)
    }
}
