//! Closed-loop tuning decisions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;

use crate::config::OptimizerConfig;

const BATCH_SHRINK_FACTOR: f64 = 0.8;
const BUFFER_SHRINK_FACTOR: f64 = 0.75;
const SAMPLING_SHRINK_FACTOR: f64 = 0.7;
/// Memory below this share of the maximum restores normal reclaim mode.
const RECLAIM_RELEASE_FRACTION: f64 = 0.8;

const CPU_GAIN_WEIGHT: f64 = 0.2;
const MEMORY_GAIN_WEIGHT: f64 = 0.3;
const LATENCY_GAIN_WEIGHT: f64 = 0.1;

/// Kind of tuning action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    AdjustBatchSize,
    AdjustBufferSize,
    AdjustSamplingRate,
    SetReclaimMode,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::AdjustBatchSize => "adjust_batch_size",
            Action::AdjustBufferSize => "adjust_buffer_size",
            Action::AdjustSamplingRate => "adjust_sampling_rate",
            Action::SetReclaimMode => "set_reclaim_mode",
        }
    }

    /// Name of the tuned parameter.
    pub fn parameter(self) -> &'static str {
        match self {
            Action::AdjustBatchSize => "batch_size",
            Action::AdjustBufferSize => "buffer_size",
            Action::AdjustSamplingRate => "sampling_rate",
            Action::SetReclaimMode => "reclaim_mode",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How eagerly the exporter side reclaims memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimMode {
    #[default]
    Normal,
    Aggressive,
}

/// Value of a tuned parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Size(usize),
    Rate(f64),
    Mode(ReclaimMode),
}

impl ParamValue {
    pub fn as_size(self) -> Option<usize> {
        match self {
            ParamValue::Size(size) => Some(size),
            _ => None,
        }
    }

    pub fn as_rate(self) -> Option<f64> {
        match self {
            ParamValue::Rate(rate) => Some(rate),
            _ => None,
        }
    }

    pub fn as_mode(self) -> Option<ReclaimMode> {
        match self {
            ParamValue::Mode(mode) => Some(mode),
            _ => None,
        }
    }
}

/// A single tuning decision. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationDecision {
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub parameter: &'static str,
    pub old_value: ParamValue,
    pub new_value: ParamValue,
    pub expected_gain: f64,
}

impl OptimizationDecision {
    fn new(action: Action, old_value: ParamValue, new_value: ParamValue, expected_gain: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            parameter: action.parameter(),
            old_value,
            new_value,
            expected_gain,
        }
    }
}

/// Measurements one optimization cycle decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Observations {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub mean_latency_ms: f64,
}

/// Current values of the tuned parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TunedParameters {
    pub batch_size: usize,
    pub buffer_size: usize,
    pub sampling_rate: f64,
    pub reclaim_mode: ReclaimMode,
}

/// Turns observations into decisions and keeps a bounded decision history.
pub struct AdaptiveController {
    config: OptimizerConfig,
    state: Mutex<ControllerState>,
}

struct ControllerState {
    params: TunedParameters,
    history: VecDeque<OptimizationDecision>,
}

impl AdaptiveController {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            config: config.clone(),
            state: Mutex::new(ControllerState {
                params: TunedParameters {
                    batch_size: config.initial_batch_size,
                    buffer_size: config.initial_buffer_size,
                    sampling_rate: config.max_sampling_rate,
                    reclaim_mode: ReclaimMode::Normal,
                },
                history: VecDeque::with_capacity(config.decision_history),
            }),
        }
    }

    /// Decide on this cycle's adjustments and append them to the history.
    pub fn decide(&self, observed: &Observations) -> Vec<OptimizationDecision> {
        let config = &self.config;
        let mut state = self.state.lock();
        let params = &mut state.params;
        let mut decisions = Vec::new();

        if config.adaptive_batching
            && observed.cpu_percent > config.max_cpu_percent
            && params.batch_size > config.min_batch_size
        {
            let next = shrink(params.batch_size, BATCH_SHRINK_FACTOR, config.min_batch_size);
            decisions.push(OptimizationDecision::new(
                Action::AdjustBatchSize,
                ParamValue::Size(params.batch_size),
                ParamValue::Size(next),
                (observed.cpu_percent - config.target_cpu_percent) * CPU_GAIN_WEIGHT,
            ));
            params.batch_size = next;
        }

        if config.resource_optimization && observed.memory_percent > config.max_memory_percent {
            let gain = (observed.memory_percent - config.target_memory_percent) * MEMORY_GAIN_WEIGHT;
            decisions.push(OptimizationDecision::new(
                Action::SetReclaimMode,
                ParamValue::Mode(params.reclaim_mode),
                ParamValue::Mode(ReclaimMode::Aggressive),
                gain,
            ));
            params.reclaim_mode = ReclaimMode::Aggressive;

            if config.adaptive_buffering && params.buffer_size > config.min_buffer_size {
                let next = shrink(params.buffer_size, BUFFER_SHRINK_FACTOR, config.min_buffer_size);
                decisions.push(OptimizationDecision::new(
                    Action::AdjustBufferSize,
                    ParamValue::Size(params.buffer_size),
                    ParamValue::Size(next),
                    gain,
                ));
                params.buffer_size = next;
            }
        } else if params.reclaim_mode == ReclaimMode::Aggressive
            && observed.memory_percent < config.max_memory_percent * RECLAIM_RELEASE_FRACTION
        {
            decisions.push(OptimizationDecision::new(
                Action::SetReclaimMode,
                ParamValue::Mode(ReclaimMode::Aggressive),
                ParamValue::Mode(ReclaimMode::Normal),
                0.0,
            ));
            params.reclaim_mode = ReclaimMode::Normal;
        }

        if config.adaptive_sampling
            && observed.mean_latency_ms > config.max_latency_ms
            && params.sampling_rate > config.min_sampling_rate
        {
            let next = (params.sampling_rate * SAMPLING_SHRINK_FACTOR).max(config.min_sampling_rate);
            decisions.push(OptimizationDecision::new(
                Action::AdjustSamplingRate,
                ParamValue::Rate(params.sampling_rate),
                ParamValue::Rate(next),
                (observed.mean_latency_ms - config.target_latency_ms) * LATENCY_GAIN_WEIGHT,
            ));
            params.sampling_rate = next;
        }

        for decision in &decisions {
            debug!(
                action = %decision.action,
                old = ?decision.old_value,
                new = ?decision.new_value,
                expected_gain = decision.expected_gain,
                "Optimization decision"
            );
            if state.history.len() == self.config.decision_history {
                state.history.pop_front();
            }
            state.history.push_back(decision.clone());
        }

        decisions
    }

    /// Decision history, oldest first.
    pub fn history(&self) -> Vec<OptimizationDecision> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn parameters(&self) -> TunedParameters {
        self.state.lock().params
    }
}

fn shrink(value: usize, factor: f64, floor: usize) -> usize {
    ((value as f64 * factor) as usize).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe(cpu: f64, memory: f64, latency_ms: f64) -> Observations {
        Observations {
            cpu_percent: cpu,
            memory_percent: memory,
            mean_latency_ms: latency_ms,
        }
    }

    #[test]
    fn test_quiet_system_yields_no_decisions() {
        let controller = AdaptiveController::new(&OptimizerConfig::default());
        assert!(controller.decide(&observe(30.0, 30.0, 100.0)).is_empty());
        assert!(controller.history().is_empty());
    }

    #[test]
    fn test_cpu_pressure_shrinks_batch() {
        let controller = AdaptiveController::new(&OptimizerConfig::default());
        let decisions = controller.decide(&observe(95.0, 30.0, 100.0));

        assert_eq!(decisions.len(), 1);
        let decision = &decisions[0];
        assert_eq!(decision.action, Action::AdjustBatchSize);
        assert_eq!(decision.parameter, "batch_size");
        assert_eq!(decision.old_value, ParamValue::Size(512));
        assert_eq!(decision.new_value, ParamValue::Size(409));
        assert!((decision.expected_gain - 7.0).abs() < 1e-9);
        assert_eq!(controller.history(), decisions);
        assert_eq!(controller.parameters().batch_size, 409);
    }

    #[test]
    fn test_batch_strictly_decreases_to_floor() {
        let controller = AdaptiveController::new(&OptimizerConfig::default());
        let mut previous = controller.parameters().batch_size;

        for _ in 0..30 {
            controller.decide(&observe(95.0, 30.0, 100.0));
            let current = controller.parameters().batch_size;
            assert!(current >= 64);
            if previous > 64 {
                assert!(current < previous);
            } else {
                assert_eq!(current, 64);
            }
            previous = current;
        }
        assert_eq!(previous, 64);
    }

    #[test]
    fn test_memory_pressure_goes_aggressive_and_shrinks_buffer() {
        let controller = AdaptiveController::new(&OptimizerConfig::default());
        let decisions = controller.decide(&observe(30.0, 90.0, 100.0));

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].action, Action::SetReclaimMode);
        assert_eq!(decisions[0].new_value, ParamValue::Mode(ReclaimMode::Aggressive));
        assert!((decisions[0].expected_gain - 9.0).abs() < 1e-9);
        assert_eq!(decisions[1].action, Action::AdjustBufferSize);
        assert_eq!(decisions[1].new_value, ParamValue::Size(1536));
    }

    #[test]
    fn test_reclaim_mode_restored_once_memory_recovers() {
        let controller = AdaptiveController::new(&OptimizerConfig::default());
        controller.decide(&observe(30.0, 90.0, 100.0));

        // Between 80 % of max and max: stay aggressive.
        assert!(controller.decide(&observe(30.0, 70.0, 100.0)).is_empty());

        let decisions = controller.decide(&observe(30.0, 50.0, 100.0));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].old_value, ParamValue::Mode(ReclaimMode::Aggressive));
        assert_eq!(decisions[0].new_value, ParamValue::Mode(ReclaimMode::Normal));
        assert_eq!(controller.parameters().reclaim_mode, ReclaimMode::Normal);
    }

    #[test]
    fn test_latency_pressure_lowers_sampling_rate() {
        let controller = AdaptiveController::new(&OptimizerConfig::default());
        let decisions = controller.decide(&observe(30.0, 30.0, 2500.0));

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, Action::AdjustSamplingRate);
        assert_eq!(decisions[0].new_value, ParamValue::Rate(0.7));

        for _ in 0..50 {
            controller.decide(&observe(30.0, 30.0, 2500.0));
        }
        assert_eq!(controller.parameters().sampling_rate, 0.01);
    }

    #[test]
    fn test_disabled_dimensions_are_left_alone() {
        let config = OptimizerConfig {
            adaptive_batching: false,
            adaptive_sampling: false,
            resource_optimization: false,
            ..OptimizerConfig::default()
        };
        let controller = AdaptiveController::new(&config);
        assert!(controller.decide(&observe(99.0, 99.0, 9999.0)).is_empty());
    }

    #[test]
    fn test_history_bounded_oldest_evicted() {
        let config = OptimizerConfig {
            decision_history: 3,
            ..OptimizerConfig::default()
        };
        let controller = AdaptiveController::new(&config);

        for _ in 0..5 {
            controller.decide(&observe(95.0, 30.0, 100.0));
        }

        let history = controller.history();
        assert_eq!(history.len(), 3);
        // 512 -> 409 -> 327 -> 261 -> 208 -> 166
        assert_eq!(history[0].old_value, ParamValue::Size(327));
        assert_eq!(history[2].new_value, ParamValue::Size(166));
    }
}
