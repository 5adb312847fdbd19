//! Observed latency analysis.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Latency statistics over the retained samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub mean: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub samples: usize,
}

impl LatencyStats {
    pub fn mean_ms(&self) -> f64 {
        self.mean.as_secs_f64() * 1000.0
    }
}

/// Ring of recent latencies; statistics are recomputed on each tick.
pub struct LatencyAnalyzer {
    state: Mutex<LatencyState>,
}

struct LatencyState {
    samples: VecDeque<Duration>,
    capacity: usize,
    stats: LatencyStats,
}

impl LatencyAnalyzer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(LatencyState {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                stats: LatencyStats::default(),
            }),
        }
    }

    pub fn record(&self, latency: Duration) {
        let mut state = self.state.lock();
        if state.samples.len() == state.capacity {
            state.samples.pop_front();
        }
        state.samples.push_back(latency);
    }

    /// Recompute mean and nearest-rank percentiles. With no samples the
    /// previous statistics are kept.
    pub fn tick(&self) -> LatencyStats {
        let mut state = self.state.lock();
        if state.samples.is_empty() {
            return state.stats;
        }

        let mut sorted: Vec<Duration> = state.samples.iter().copied().collect();
        sorted.sort_unstable();

        state.stats = LatencyStats {
            mean: mean(&sorted),
            p95: nearest_rank(&sorted, 0.95),
            p99: nearest_rank(&sorted, 0.99),
            samples: sorted.len(),
        };
        state.stats
    }

    pub fn stats(&self) -> LatencyStats {
        self.state.lock().stats
    }
}

/// Mean of a non-empty slice, summed in nanoseconds so that outliers such as
/// `Duration::MAX` cannot overflow.
fn mean(samples: &[Duration]) -> Duration {
    let total: u128 = samples.iter().map(Duration::as_nanos).sum();
    let nanos = total / samples.len() as u128;
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn nearest_rank(sorted: &[Duration], percentile: f64) -> Duration {
    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
