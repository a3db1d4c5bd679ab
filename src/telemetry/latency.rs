//! Per-provider latency tracking.
//!
//! Each provider gets a fixed-capacity ring of recent request durations in
//! milliseconds. `record` and `stats` are O(1); once the ring is full the
//! oldest sample is overwritten in place.

use std::time::Duration;

use dashmap::DashMap;

/// Aggregate view over one provider's latency window.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct LatencyStats {
    /// Average over the window; `+∞` when no samples exist, so providers
    /// without data rank last under the latency strategy while staying
    /// eligible.
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub count: usize,
}

impl LatencyStats {
    fn empty() -> Self {
        Self { avg_ms: f64::INFINITY, min_ms: 0, max_ms: 0, count: 0 }
    }
}

/// Fixed-capacity sliding window with constant-time overwrite.
struct Ring {
    samples: Vec<u64>,
    capacity: usize,
    /// Next write position once the ring is full.
    next: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self { samples: Vec::with_capacity(capacity), capacity, next: 0 }
    }

    fn push(&mut self, value: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            self.samples[self.next] = value;
            self.next = (self.next + 1) % self.capacity;
        }
    }

    fn stats(&self) -> LatencyStats {
        if self.samples.is_empty() {
            return LatencyStats::empty();
        }
        let sum: u64 = self.samples.iter().sum();
        LatencyStats {
            avg_ms: sum as f64 / self.samples.len() as f64,
            min_ms: *self.samples.iter().min().expect("non-empty"),
            max_ms: *self.samples.iter().max().expect("non-empty"),
            count: self.samples.len(),
        }
    }
}

/// Process-wide latency tracker, one ring per provider name.
pub struct LatencyTracker {
    window: usize,
    rings: DashMap<String, Ring>,
}

impl LatencyTracker {
    /// `window` is the per-provider sample capacity.
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1), rings: DashMap::new() }
    }

    /// Record one request duration for `provider`.
    pub fn record(&self, provider: &str, duration: Duration) {
        let mut ring = self
            .rings
            .entry(provider.to_string())
            .or_insert_with(|| Ring::new(self.window));
        ring.push(duration.as_millis() as u64);
    }

    /// Average latency in milliseconds; `+∞` when no samples exist.
    pub fn average(&self, provider: &str) -> f64 {
        self.rings
            .get(provider)
            .map(|r| r.stats().avg_ms)
            .unwrap_or(f64::INFINITY)
    }

    pub fn stats(&self, provider: &str) -> LatencyStats {
        self.rings
            .get(provider)
            .map(|r| r.stats())
            .unwrap_or_else(LatencyStats::empty)
    }

    /// Provider names with at least one recorded sample.
    pub fn tracked_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rings.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
