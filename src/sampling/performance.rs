//! Pipeline overhead tracking.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Tracks the share of wall time spent inside the telemetry pipeline.
///
/// Durations are accumulated with relaxed atomics; concurrent updates may
/// race with a ratio read, which only biases the reported ratio slightly.
pub struct PerformanceTracker {
    max_overhead_ratio: f64,
    start: Instant,
    pipeline_nanos: AtomicU64,
    event_count: AtomicU64,
}

/// Snapshot of the overhead budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub overhead_ratio: f64,
    pub max_overhead_ratio: f64,
    pub event_count: u64,
    pub pipeline_time: Duration,
}

impl PerformanceTracker {
    /// Create a tracker with the ceiling given in percent.
    pub fn new(max_overhead_percent: f64) -> Self {
        Self::new_at(max_overhead_percent, Instant::now())
    }

    pub(crate) fn new_at(max_overhead_percent: f64, start: Instant) -> Self {
        Self {
            max_overhead_ratio: max_overhead_percent / 100.0,
            start,
            pipeline_nanos: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
        }
    }

    /// Add time spent governing or exporting one event.
    pub fn record(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        // Saturate so a huge outlier cannot wrap the total back towards zero.
        let _ = self
            .pipeline_nanos
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_add(nanos))
            });
        self.event_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overhead_ratio(&self) -> f64 {
        self.overhead_ratio_at(Instant::now())
    }

    pub(crate) fn overhead_ratio_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start).as_nanos();
        if elapsed == 0 {
            return 0.0;
        }
        self.pipeline_nanos.load(Ordering::Relaxed) as f64 / elapsed as f64
    }

    /// Whether the pipeline is still within its overhead budget.
    pub fn within_budget(&self) -> bool {
        self.within_budget_at(Instant::now())
    }

    pub(crate) fn within_budget_at(&self, now: Instant) -> bool {
        self.overhead_ratio_at(now) < self.max_overhead_ratio
    }

    pub fn stats(&self) -> PerformanceStats {
        PerformanceStats {
            overhead_ratio: self.overhead_ratio(),
            max_overhead_ratio: self.max_overhead_ratio,
            event_count: self.event_count.load(Ordering::Relaxed),
            pipeline_time: Duration::from_nanos(self.pipeline_nanos.load(Ordering::Relaxed)),
        }
    }
}
