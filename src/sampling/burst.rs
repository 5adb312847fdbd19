//! Burst detection.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Counts events in fixed windows and trips once a window exceeds the threshold.
///
/// Once tripped, the detector stays tripped until the window ends, so burst
/// sampling applies to the remainder of the window in which the spike
/// happened.
pub struct BurstDetector {
    threshold: u64,
    window: Duration,
    state: Mutex<BurstState>,
}

struct BurstState {
    window_start: Instant,
    event_count: u64,
    tripped: bool,
}

impl BurstDetector {
    pub fn new(threshold: u64, window: Duration) -> Self {
        Self::new_at(threshold, window, Instant::now())
    }

    pub(crate) fn new_at(threshold: u64, window: Duration, now: Instant) -> Self {
        Self {
            threshold,
            window,
            state: Mutex::new(BurstState {
                window_start: now,
                event_count: 0,
                tripped: false,
            }),
        }
    }

    /// Count one event and report whether the current window is bursting.
    pub fn observe(&self) -> bool {
        self.observe_at(Instant::now())
    }

    pub(crate) fn observe_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        if now.saturating_duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.event_count = 0;
            state.tripped = false;
        }

        state.event_count += 1;
        if state.event_count > self.threshold {
            state.tripped = true;
        }
        state.tripped
    }

    pub fn is_bursting(&self) -> bool {
        self.state.lock().tripped
    }
}
