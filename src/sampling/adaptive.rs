//! Windowed adaptive rate adjustment.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Lower bound of the adaptive multiplier.
pub const MIN_MULTIPLIER: f64 = 0.01;
/// Upper bound of the adaptive multiplier.
pub const MAX_MULTIPLIER: f64 = 1.0;

const DECREASE_FACTOR: f64 = 0.9;
const INCREASE_FACTOR: f64 = 1.1;
/// A window sampling below this share of the target is considered starved.
const STARVED_FRACTION: f64 = 0.8;

/// Internal inconsistency detected while computing a sampling decision.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SamplingFault {
    #[error("adaptive window has zero length")]
    ZeroWindow,
    #[error("adaptive state is not finite")]
    CorruptedState,
    #[error("computed rate is not a number")]
    InvalidRate,
}

/// Steers the sampled fraction of one severity towards a target.
///
/// The multiplier is recomputed once per window from the previous window's
/// counters; counters then restart from zero.
pub struct AdaptiveWindow {
    target_rate: f64,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    current_rate: f64,
    window_start: Instant,
    event_count: u64,
    sampled_count: u64,
}

/// Snapshot of an adaptive window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdaptiveStats {
    pub current_rate: f64,
    pub target_rate: f64,
    pub event_count: u64,
    pub sampled_count: u64,
}

impl AdaptiveWindow {
    pub fn new(target_rate: f64, window: Duration) -> Self {
        Self::new_at(target_rate, window, Instant::now())
    }

    pub(crate) fn new_at(target_rate: f64, window: Duration, now: Instant) -> Self {
        Self {
            target_rate,
            window,
            state: Mutex::new(WindowState {
                current_rate: MAX_MULTIPLIER,
                window_start: now,
                event_count: 0,
                sampled_count: 0,
            }),
        }
    }

    /// Current multiplier, rolling the window first if it has elapsed.
    pub fn multiplier(&self) -> Result<f64, SamplingFault> {
        self.multiplier_at(Instant::now())
    }

    pub(crate) fn multiplier_at(&self, now: Instant) -> Result<f64, SamplingFault> {
        if self.window.is_zero() {
            return Err(SamplingFault::ZeroWindow);
        }

        let mut state = self.state.lock();
        if !state.current_rate.is_finite() {
            // Start over from a neutral multiplier; the caller fails open.
            state.current_rate = MAX_MULTIPLIER;
            state.reset(now);
            return Err(SamplingFault::CorruptedState);
        }

        if now.saturating_duration_since(state.window_start) >= self.window {
            if state.event_count > 0 {
                let actual = state.sampled_count as f64 / state.event_count as f64;
                let previous = state.current_rate;

                if actual > self.target_rate {
                    state.current_rate *= DECREASE_FACTOR;
                } else if actual < self.target_rate * STARVED_FRACTION {
                    state.current_rate *= INCREASE_FACTOR;
                }
                state.current_rate = state.current_rate.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);

                debug!(
                    actual_rate = actual,
                    target_rate = self.target_rate,
                    previous,
                    current = state.current_rate,
                    "Adaptive window rolled over"
                );
            }
            state.reset(now);
        }

        Ok(state.current_rate)
    }

    /// Count one decision in the current window.
    pub fn record(&self, sampled: bool) {
        let mut state = self.state.lock();
        state.event_count += 1;
        if sampled {
            state.sampled_count += 1;
        }
    }

    pub fn stats(&self) -> AdaptiveStats {
        let state = self.state.lock();
        AdaptiveStats {
            current_rate: state.current_rate,
            target_rate: self.target_rate,
            event_count: state.event_count,
            sampled_count: state.sampled_count,
        }
    }

    #[cfg(test)]
    fn corrupt(&self) {
        self.state.lock().current_rate = f64::NAN;
    }
}

impl WindowState {
    fn reset(&mut self, now: Instant) {
        self.event_count = 0;
        self.sampled_count = 0;
        self.window_start = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn fill(window: &AdaptiveWindow, events: u64, sampled: u64) {
        for i in 0..events {
            window.record(i < sampled);
        }
    }

    #[test]
    fn test_starts_neutral() {
        let start = Instant::now();
        let window = AdaptiveWindow::new_at(0.8, WINDOW, start);
        assert_eq!(window.multiplier_at(start), Ok(1.0));
    }

    #[test]
    fn test_oversampling_decreases_multiplier() {
        let start = Instant::now();
        let window = AdaptiveWindow::new_at(0.5, WINDOW, start);
        fill(&window, 10, 9);

        let rate = window.multiplier_at(start + WINDOW).unwrap();
        assert!((rate - 0.9).abs() < 1e-9);
        assert_eq!(window.stats().event_count, 0);
    }

    #[test]
    fn test_undersampling_increases_multiplier_up_to_cap() {
        let start = Instant::now();
        let window = AdaptiveWindow::new_at(0.8, WINDOW, start);

        fill(&window, 10, 10);
        let lowered = window.multiplier_at(start + WINDOW).unwrap();
        assert!(lowered < 1.0);

        fill(&window, 10, 1);
        let raised = window.multiplier_at(start + WINDOW * 2).unwrap();
        assert!(raised > lowered);
        assert!(raised <= MAX_MULTIPLIER);
    }

    #[test]
    fn test_multiplier_stays_within_bounds() {
        let start = Instant::now();
        let window = AdaptiveWindow::new_at(0.1, WINDOW, start);

        for round in 1..200u32 {
            if round % 3 == 0 {
                fill(&window, 10, 0);
            } else {
                fill(&window, 10, 10);
            }
            let rate = window.multiplier_at(start + WINDOW * round).unwrap();
            assert!((MIN_MULTIPLIER..=MAX_MULTIPLIER).contains(&rate), "rate {rate}");
        }
    }

    #[test]
    fn test_sustained_oversampling_floors_at_minimum() {
        let start = Instant::now();
        let window = AdaptiveWindow::new_at(0.0, WINDOW, start);

        for round in 1..100u32 {
            fill(&window, 5, 5);
            window.multiplier_at(start + WINDOW * round).unwrap();
        }
        assert_eq!(window.stats().current_rate, MIN_MULTIPLIER);
    }

    #[test]
    fn test_empty_window_keeps_multiplier() {
        let start = Instant::now();
        let window = AdaptiveWindow::new_at(0.8, WINDOW, start);
        assert_eq!(window.multiplier_at(start + WINDOW * 3), Ok(1.0));
    }

    #[test]
    fn test_zero_window_is_a_fault() {
        let window = AdaptiveWindow::new(0.8, Duration::ZERO);
        assert_eq!(window.multiplier(), Err(SamplingFault::ZeroWindow));
    }

    #[test]
    fn test_corrupted_state_resets() {
        let start = Instant::now();
        let window = AdaptiveWindow::new_at(0.8, WINDOW, start);
        window.corrupt();

        assert_eq!(window.multiplier_at(start), Err(SamplingFault::CorruptedState));
        assert_eq!(window.multiplier_at(start), Ok(1.0));
    }
}
