//! Per-second rates from cumulative counters

use std::time::Instant;

/// Turns a cumulative counter into a per-second rate.
///
/// The first observation has nothing to compare against and reports 0.
/// A counter that goes backwards (collector restart) also reports 0 and
/// becomes the new baseline.
#[derive(Debug, Clone, Default)]
pub struct RateTracker {
    previous: Option<(u64, Instant)>,
    rate: f64,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, value: u64, at: Instant) -> f64 {
        let Some((prev_value, prev_at)) = self.previous else {
            self.previous = Some((value, at));
            self.rate = 0.0;
            return self.rate;
        };

        let elapsed = at.saturating_duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return self.rate;
        }

        self.rate = match value.checked_sub(prev_value) {
            Some(delta) => delta as f64 / elapsed,
            None => 0.0,
        };
        self.previous = Some((value, at));
        self.rate
    }

    /// Most recently derived rate
    pub fn rate(&self) -> f64 {
        self.rate
    }
}
