//! Served-event throughput analysis.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Throughput statistics in events per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThroughputStats {
    pub current: f64,
    pub average: f64,
    pub peak: f64,
    pub samples: usize,
}

/// Counts served events and turns the count into a rate on every tick.
pub struct ThroughputAnalyzer {
    served: AtomicU64,
    state: Mutex<ThroughputState>,
}

struct ThroughputState {
    last_count: u64,
    last_tick: Instant,
    history: VecDeque<f64>,
    capacity: usize,
    stats: ThroughputStats,
}

impl ThroughputAnalyzer {
    pub fn new(capacity: usize) -> Self {
        Self::new_at(capacity, Instant::now())
    }

    pub(crate) fn new_at(capacity: usize, now: Instant) -> Self {
        let capacity = capacity.max(1);
        Self {
            served: AtomicU64::new(0),
            state: Mutex::new(ThroughputState {
                last_count: 0,
                last_tick: now,
                history: VecDeque::with_capacity(capacity),
                capacity,
                stats: ThroughputStats::default(),
            }),
        }
    }

    pub fn record_event(&self) {
        self.served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn tick(&self) -> ThroughputStats {
        self.tick_at(Instant::now())
    }

    /// Compute the rate since the previous tick and fold it into the history.
    pub(crate) fn tick_at(&self, now: Instant) -> ThroughputStats {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_tick);
        if elapsed.is_zero() {
            return state.stats;
        }

        let count = self.served.load(Ordering::Relaxed);
        let current = count.saturating_sub(state.last_count) as f64 / elapsed.as_secs_f64();

        if state.history.len() == state.capacity {
            state.history.pop_front();
        }
        state.history.push_back(current);

        let sum: f64 = state.history.iter().sum();
        let peak = state.history.iter().copied().fold(0.0, f64::max);
        state.stats = ThroughputStats {
            current,
            average: sum / state.history.len() as f64,
            peak,
            samples: state.history.len(),
        };
        state.last_count = count;
        state.last_tick = now;
        state.stats
    }

    pub fn stats(&self) -> ThroughputStats {
        self.state.lock().stats
    }
}
