//! Fixed-schema log2 histogram
//!
//! Bucket `i` counts samples `v` with `2^i <= v < 2^(i+1)`; zero lands in
//! bucket 0 and anything past the last bucket is clamped into it. The
//! bucket count is part of the kernel-facing contract and must not change.

use crate::models::HISTOGRAM_SLOTS;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bucket index for a sample, clamped to `[0, 63]`
pub fn slot_for(value: u64) -> usize {
    if value == 0 {
        return 0;
    }
    ((u64::BITS - 1 - value.leading_zeros()) as usize).min(HISTOGRAM_SLOTS - 1)
}

/// Concurrently updated histogram; every update is a single fetch-and-add
#[derive(Debug)]
pub struct Log2Histogram {
    slots: [AtomicU64; HISTOGRAM_SLOTS],
}

impl Default for Log2Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Log2Histogram {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, value: u64) {
        self.slots[slot_for(value)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            slots: std::array::from_fn(|i| self.slots[i].load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of a histogram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    #[serde(with = "slots_serde")]
    pub slots: [u64; HISTOGRAM_SLOTS],
}

impl Default for HistogramSnapshot {
    fn default() -> Self {
        Self {
            slots: [0; HISTOGRAM_SLOTS],
        }
    }
}

impl HistogramSnapshot {
    /// Build a snapshot from raw samples
    pub fn from_values(values: impl IntoIterator<Item = u64>) -> Self {
        let mut snapshot = Self::default();
        for value in values {
            snapshot.slots[slot_for(value)] += 1;
        }
        snapshot
    }

    pub fn total(&self) -> u64 {
        self.slots.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// serde only derives arrays up to 32 elements
mod slots_serde {
    use super::HISTOGRAM_SLOTS;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(slots: &[u64; HISTOGRAM_SLOTS], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(slots.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u64; HISTOGRAM_SLOTS], D::Error> {
        let values = Vec::<u64>::deserialize(d)?;
        let len = values.len();
        values
            .try_into()
            .map_err(|_| D::Error::invalid_length(len, &"64 histogram slots"))
    }
}
