//! Metric normalization and the weighted composite score

use crate::models::{NodeMetrics, ScoringSeries};
use serde::{Deserialize, Serialize};

/// Score given to nodes with no cached metrics
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Contribution of a metric whose operating range has zero width
pub const NEUTRAL_NORMALIZED: f64 = 0.5;

/// Clamp `value` to `[min, max]` and map it linearly onto `[0, 1]`.
///
/// With `lower_is_better` the result is inverted so that `min` maps to 1.
/// A zero-width range yields 0.5.
pub fn normalize(value: f64, min: f64, max: f64, lower_is_better: bool) -> f64 {
    if max == min {
        return NEUTRAL_NORMALIZED;
    }

    let clamped = if value.is_nan() {
        max
    } else {
        value.clamp(min.min(max), min.max(max))
    };
    let normalized = (clamped - min) / (max - min);

    if lower_is_better {
        1.0 - normalized
    } else {
        normalized
    }
}

/// Per-series weights of the composite score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub rtt_p99: f64,
    pub retrans_rate: f64,
    pub drop_rate: f64,
    pub runqlat_p95: f64,
    pub cpu_util: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            rtt_p99: 0.30,
            retrans_rate: 0.20,
            drop_rate: 0.20,
            runqlat_p95: 0.15,
            cpu_util: 0.15,
        }
    }
}

impl ScoreWeights {
    pub fn weight(&self, series: ScoringSeries) -> f64 {
        match series {
            ScoringSeries::RttP99 => self.rtt_p99,
            ScoringSeries::RetransRate => self.retrans_rate,
            ScoringSeries::DropRate => self.drop_rate,
            ScoringSeries::RunqlatP95 => self.runqlat_p95,
            ScoringSeries::CpuUtil => self.cpu_util,
        }
    }

    pub fn sum(&self) -> f64 {
        ScoringSeries::ALL.iter().map(|s| self.weight(*s)).sum()
    }
}

/// Operating range `(min, max)` of one series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRange {
    pub min: f64,
    pub max: f64,
}

impl MetricRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Operating ranges for all five series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRanges {
    pub rtt_p99_ms: MetricRange,
    pub retrans_rate: MetricRange,
    pub drop_rate: MetricRange,
    pub runqlat_p95_ms: MetricRange,
    pub cpu_util: MetricRange,
}

impl Default for MetricRanges {
    fn default() -> Self {
        Self {
            rtt_p99_ms: MetricRange::new(0.0, 500.0),
            retrans_rate: MetricRange::new(0.0, 100.0),
            drop_rate: MetricRange::new(0.0, 100.0),
            runqlat_p95_ms: MetricRange::new(0.0, 100.0),
            cpu_util: MetricRange::new(0.0, 100.0),
        }
    }
}

impl MetricRanges {
    pub fn range(&self, series: ScoringSeries) -> MetricRange {
        match series {
            ScoringSeries::RttP99 => self.rtt_p99_ms,
            ScoringSeries::RetransRate => self.retrans_rate,
            ScoringSeries::DropRate => self.drop_rate,
            ScoringSeries::RunqlatP95 => self.runqlat_p95_ms,
            ScoringSeries::CpuUtil => self.cpu_util,
        }
    }
}

/// Weights plus ranges: everything needed to score a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringModel {
    pub weights: ScoreWeights,
    pub ranges: MetricRanges,
}

impl ScoringModel {
    pub fn new(weights: ScoreWeights) -> Self {
        Self {
            weights,
            ranges: MetricRanges::default(),
        }
    }

    /// Normalized value of every series; all five are lower-is-better
    pub fn normalize(&self, raw: &NodeMetrics) -> NodeMetrics {
        let mut normalized = NodeMetrics::default();
        for series in ScoringSeries::ALL {
            let range = self.ranges.range(series);
            normalized.set(
                series,
                normalize(raw.get(series), range.min, range.max, true),
            );
        }
        normalized
    }

    /// Composite score in `[0, 100]` from already normalized values
    pub fn composite(&self, normalized: &NodeMetrics) -> f64 {
        let weighted: f64 = ScoringSeries::ALL
            .iter()
            .map(|s| self.weights.weight(*s) * normalized.get(*s))
            .sum();
        (weighted * 100.0).clamp(0.0, 100.0)
    }

    pub fn score(&self, raw: &NodeMetrics) -> f64 {
        self.composite(&self.normalize(raw))
    }
}
