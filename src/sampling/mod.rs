//! Sampling decisions for candidate events.
//!
//! A decision runs through a fixed sequence of gates: severity bypass,
//! pipeline overhead, per-severity rate limit, base rate capped by the
//! optimizer ceiling, adaptive multiplier, context multiplier, burst cap and
//! finally a probabilistic draw.

mod adaptive;
mod burst;
mod context;
mod controller;
mod limiter;
mod performance;
mod severity;

pub use adaptive::{AdaptiveStats, AdaptiveWindow, SamplingFault, MAX_MULTIPLIER, MIN_MULTIPLIER};
pub use burst::BurstDetector;
pub use context::{context_key, ContextSampler, COMPONENT_ATTRIBUTE, HIGH_VALUE_MULTIPLIER, LOW_VALUE_MULTIPLIER};
pub use controller::{DecisionCount, Gate, SamplingController, SamplingStats};
pub use limiter::TokenBucket;
pub use performance::{PerformanceStats, PerformanceTracker};
pub use severity::{LevelRates, Severity};
