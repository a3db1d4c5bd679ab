//! Per-provider telemetry feeding routing decisions: realized/estimated cost
//! and a bounded latency window. Both are cheap enough to update on every
//! request attempt.

pub mod cost;
pub mod latency;

pub use cost::CostTable;
pub use latency::{LatencyStats, LatencyTracker};
