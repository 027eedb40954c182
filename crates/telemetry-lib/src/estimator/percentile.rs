//! Percentile estimation over log2 histograms

use crate::collector::HistogramSnapshot;
use crate::models::HISTOGRAM_SLOTS;

/// Estimate the `p`-th percentile of a log2 histogram.
///
/// Walks the buckets in increasing order and returns the representative
/// value `2^i` of the first bucket whose cumulative count reaches the
/// target rank `floor(total * p / 100)`, clamped to at least 1. An empty
/// histogram yields 0.
///
/// The estimate is the lower bound of the bucket holding the true value,
/// so it under-reports by less than the bucket's width: a true value `v`
/// in bucket `i` satisfies `2^i <= v < 2^(i+1)`.
pub fn percentile(hist: &HistogramSnapshot, p: f64) -> u64 {
    percentile_of_slots(&hist.slots, p)
}

pub fn percentile_of_slots(slots: &[u64], p: f64) -> u64 {
    let total: u64 = slots.iter().sum();
    if total == 0 {
        return 0;
    }

    let p = p.clamp(0.0, 100.0);
    let target = ((total as f64 * p / 100.0).floor() as u64).max(1);

    let mut cumulative = 0u64;
    for (i, count) in slots.iter().enumerate().take(HISTOGRAM_SLOTS) {
        cumulative += count;
        if cumulative >= target {
            return bucket_floor(i);
        }
    }
    bucket_floor(slots.len().min(HISTOGRAM_SLOTS) - 1)
}

/// Representative (lower bound) value of bucket `i`
pub fn bucket_floor(i: usize) -> u64 {
    1u64 << i.min(HISTOGRAM_SLOTS - 1)
}
