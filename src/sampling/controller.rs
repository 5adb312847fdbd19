//! The sampling decision pipeline.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use super::adaptive::{AdaptiveStats, AdaptiveWindow, SamplingFault};
use super::burst::BurstDetector;
use super::context::ContextSampler;
use super::limiter::TokenBucket;
use super::performance::{PerformanceStats, PerformanceTracker};
use super::severity::{LevelRates, Severity};
use crate::config::{check_fraction, SamplingConfig};
use crate::error::Result;
use crate::event::Attributes;

/// The gate that settled a sampling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// Error and above, recorded unconditionally
    Severity,
    /// An internal fault was hit and the event was recorded anyway
    FailOpen,
    /// Pipeline overhead above its ceiling
    Performance,
    /// Per-severity token bucket exhausted
    RateLimit,
    /// Probabilistic draw at the burst-capped rate.
    ///
    /// During a burst the rate is `min(rate, burst_sample_rate)`: a burst only
    /// ever lowers sampling, so contexts already sampled below the burst rate
    /// keep their lower rate.
    Burst,
    /// Probabilistic draw at the computed rate
    Probability,
}

impl Gate {
    pub fn as_str(self) -> &'static str {
        match self {
            Gate::Severity => "severity",
            Gate::FailOpen => "fail_open",
            Gate::Performance => "performance",
            Gate::RateLimit => "rate_limit",
            Gate::Burst => "burst",
            Gate::Probability => "probability",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DecisionKey {
    gate: Gate,
    recorded: bool,
}

/// Number of decisions settled by one gate with one outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionCount {
    pub gate: Gate,
    pub recorded: bool,
    pub count: u64,
}

/// Snapshot of the controller state.
#[derive(Debug, Clone, Serialize)]
pub struct SamplingStats {
    pub rates: LevelRates,
    pub ceiling: f64,
    pub adaptive: Vec<(Severity, AdaptiveStats)>,
    pub performance: PerformanceStats,
    pub decisions: Vec<DecisionCount>,
    pub rate_updates: u64,
}

/// Per-severity decision state, created once and kept for the process lifetime.
struct LevelState {
    bucket: Option<TokenBucket>,
    window: Option<AdaptiveWindow>,
    burst: Option<BurstDetector>,
}

struct RateTable {
    base: LevelRates,
    /// Upper bound on every base rate, lowered by the optimizer under load
    ceiling: f64,
}

/// Decides whether candidate events are recorded.
///
/// This struct is thread-safe and meant to be shared across request handlers.
/// Decisions never block on I/O; each severity's state sits behind its own
/// lock so callers at different severities do not contend.
pub struct SamplingController {
    rates: RwLock<RateTable>,
    levels: [LevelState; 5],
    context: Option<ContextSampler>,
    performance: PerformanceTracker,
    performance_gate: bool,
    burst_rate: f64,
    decisions: DashMap<DecisionKey, u64>,
    rate_updates: AtomicU64,
}

impl SamplingController {
    /// Build the controller from configuration.
    pub fn new(config: &SamplingConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    pub(crate) fn new_at(config: &SamplingConfig, now: Instant) -> Self {
        let levels = Severity::ALL.map(|severity| {
            let limit = match severity {
                Severity::Debug => config.debug_rate_limit,
                Severity::Info => config.info_rate_limit,
                Severity::Warn => config.warn_rate_limit,
                Severity::Error | Severity::Fatal => None,
            };
            LevelState {
                bucket: limit.map(|per_second| TokenBucket::new_at(per_second, now)),
                window: config.adaptive_enabled.then(|| {
                    AdaptiveWindow::new_at(config.adaptive_target_rate, config.adaptive_window(), now)
                }),
                burst: config.burst_protection_enabled.then(|| {
                    BurstDetector::new_at(config.burst_threshold, config.burst_window(), now)
                }),
            }
        });

        let context = config.contextual_enabled.then(|| {
            ContextSampler::new(
                &config.high_value_contexts,
                &config.low_value_contexts,
                &config.context_rates,
            )
        });

        debug!(
            adaptive = config.adaptive_enabled,
            contextual = config.contextual_enabled,
            performance_gate = config.performance_gate_enabled,
            burst_protection = config.burst_protection_enabled,
            "Sampling controller initialized"
        );

        Self {
            rates: RwLock::new(RateTable {
                base: config.rates,
                ceiling: 1.0,
            }),
            levels,
            context,
            performance: PerformanceTracker::new_at(config.max_overhead_percent, now),
            performance_gate: config.performance_gate_enabled,
            burst_rate: config.burst_sample_rate,
            decisions: DashMap::new(),
            rate_updates: AtomicU64::new(0),
        }
    }

    /// Decide whether an event at `severity` with `attributes` is recorded.
    pub fn should_record(&self, severity: Severity, attributes: &Attributes) -> bool {
        self.should_record_at(severity, attributes, Instant::now())
    }

    pub(crate) fn should_record_at(
        &self,
        severity: Severity,
        attributes: &Attributes,
        now: Instant,
    ) -> bool {
        if severity.is_always_recorded() {
            self.count(Gate::Severity, true);
            return true;
        }

        let level = &self.levels[severity.index()];
        let (gate, recorded) = match self.decide(level, severity, attributes, now) {
            Ok(decision) => decision,
            Err(fault) => {
                debug!(severity = %severity, error = %fault, "Sampling fault, recording event");
                (Gate::FailOpen, true)
            }
        };

        if let Some(window) = &level.window {
            window.record(recorded);
        }
        self.count(gate, recorded);

        trace!(
            severity = %severity,
            gate = gate.as_str(),
            recorded,
            "Sampling decision"
        );
        recorded
    }

    fn decide(
        &self,
        level: &LevelState,
        severity: Severity,
        attributes: &Attributes,
        now: Instant,
    ) -> std::result::Result<(Gate, bool), SamplingFault> {
        // Every event counts towards burst frequency, even ones dropped early.
        let bursting = level
            .burst
            .as_ref()
            .map(|burst| burst.observe_at(now))
            .unwrap_or(false);

        if self.performance_gate && !self.performance.within_budget_at(now) {
            return Ok((Gate::Performance, false));
        }

        if let Some(bucket) = &level.bucket {
            if !bucket.allow_at(now) {
                return Ok((Gate::RateLimit, false));
            }
        }

        let mut rate = {
            let rates = self.rates.read();
            rates.base.get(severity).min(rates.ceiling)
        };

        if let Some(window) = &level.window {
            rate *= window.multiplier_at(now)?;
        }

        if let Some(context) = &self.context {
            rate *= context.rate_for(attributes);
        }

        let mut gate = Gate::Probability;
        if bursting {
            rate = rate.min(self.burst_rate);
            gate = Gate::Burst;
        }

        if rate.is_nan() {
            return Err(SamplingFault::InvalidRate);
        }

        Ok((gate, draw(rate)))
    }

    fn count(&self, gate: Gate, recorded: bool) {
        *self
            .decisions
            .entry(DecisionKey { gate, recorded })
            .or_insert(0) += 1;
    }

    /// Replace the base rate of every severity.
    pub fn update_sampling_rates(&self, rates: LevelRates) -> Result<()> {
        rates.validate()?;
        self.rates.write().base = rates;
        self.rate_updates.fetch_add(1, Ordering::Relaxed);
        info!(?rates, "Sampling rates updated");
        Ok(())
    }

    /// Cap every base rate at `ceiling`.
    pub fn set_sampling_ceiling(&self, ceiling: f64) -> Result<()> {
        check_fraction("sampling ceiling", ceiling)?;
        let previous = std::mem::replace(&mut self.rates.write().ceiling, ceiling);
        self.rate_updates.fetch_add(1, Ordering::Relaxed);
        debug!(previous, ceiling, "Sampling ceiling updated");
        Ok(())
    }

    pub fn sampling_ceiling(&self) -> f64 {
        self.rates.read().ceiling
    }

    pub fn rates(&self) -> LevelRates {
        self.rates.read().base
    }

    /// Set the multiplier for a context key. No effect when contextual
    /// sampling is disabled.
    pub fn set_context_rate(&self, context: impl Into<String>, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(crate::error::TollgateError::Config(format!(
                "context rate must be a non-negative number, got {rate}"
            )));
        }
        if let Some(sampler) = &self.context {
            sampler.set_rate(context, rate);
        }
        Ok(())
    }

    pub fn remove_context_rate(&self, context: &str) -> Option<f64> {
        self.context.as_ref().and_then(|sampler| sampler.remove_rate(context))
    }

    /// Account time spent inside the telemetry pipeline.
    pub fn record_pipeline_duration(&self, duration: Duration) {
        self.performance.record(duration);
    }

    pub fn overhead_ratio(&self) -> f64 {
        self.performance.overhead_ratio()
    }

    /// Number of decisions settled by `gate` with the given outcome.
    pub fn decision_count(&self, gate: Gate, recorded: bool) -> u64 {
        self.decisions
            .get(&DecisionKey { gate, recorded })
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> SamplingStats {
        let (rates, ceiling) = {
            let table = self.rates.read();
            (table.base, table.ceiling)
        };

        let adaptive = Severity::ALL
            .iter()
            .filter_map(|severity| {
                self.levels[severity.index()]
                    .window
                    .as_ref()
                    .map(|window| (*severity, window.stats()))
            })
            .collect();

        let mut decisions: Vec<DecisionCount> = self
            .decisions
            .iter()
            .map(|entry| DecisionCount {
                gate: entry.key().gate,
                recorded: entry.key().recorded,
                count: *entry.value(),
            })
            .collect();
        decisions.sort_by_key(|d| (d.gate.as_str(), d.recorded));

        SamplingStats {
            rates,
            ceiling,
            adaptive,
            performance: self.performance.stats(),
            decisions,
            rate_updates: self.rate_updates.load(Ordering::Relaxed),
        }
    }
}

/// Final probabilistic draw.
fn draw(rate: f64) -> bool {
    if rate >= 1.0 {
        true
    } else if rate <= 0.0 {
        false
    } else {
        rand::random::<f64>() < rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quiet_config() -> SamplingConfig {
        SamplingConfig {
            rates: LevelRates {
                debug: 1.0,
                info: 1.0,
                warn: 1.0,
                error: 1.0,
                fatal: 1.0,
            },
            debug_rate_limit: None,
            info_rate_limit: None,
            warn_rate_limit: None,
            adaptive_enabled: false,
            contextual_enabled: false,
            performance_gate_enabled: false,
            burst_protection_enabled: false,
            ..SamplingConfig::default()
        }
    }

    fn no_attrs() -> Attributes {
        Attributes::new()
    }

    #[test]
    fn test_error_recorded_without_prior_calls() {
        let controller = SamplingController::new(&SamplingConfig::default());
        assert!(controller.should_record(Severity::Error, &no_attrs()));
        assert_eq!(controller.decision_count(Gate::Severity, true), 1);
    }

    #[test]
    fn test_error_and_fatal_bypass_every_gate() {
        let config = SamplingConfig {
            rates: LevelRates {
                debug: 0.0,
                info: 0.0,
                warn: 0.0,
                error: 0.0,
                fatal: 0.0,
            },
            debug_rate_limit: Some(1),
            burst_threshold: 0,
            ..SamplingConfig::default()
        };
        let controller = SamplingController::new(&config);
        controller.record_pipeline_duration(Duration::from_secs(3600));
        controller.set_sampling_ceiling(0.0).unwrap();

        for _ in 0..100 {
            assert!(controller.should_record(Severity::Error, &no_attrs()));
            assert!(controller.should_record(Severity::Fatal, &no_attrs()));
        }
    }

    #[test]
    fn test_rate_limit_scenario() {
        let config = SamplingConfig {
            info_rate_limit: Some(2),
            ..quiet_config()
        };
        let start = Instant::now();
        let controller = SamplingController::new_at(&config, start);

        let recorded = (0..5)
            .filter(|_| controller.should_record_at(Severity::Info, &no_attrs(), start))
            .count();

        assert_eq!(recorded, 2);
        assert_eq!(controller.decision_count(Gate::RateLimit, false), 3);
        assert_eq!(controller.decision_count(Gate::Probability, true), 2);
    }

    #[test]
    fn test_performance_gate_drops_below_error() {
        let config = SamplingConfig {
            performance_gate_enabled: true,
            max_overhead_percent: 1.0,
            ..quiet_config()
        };
        let start = Instant::now();
        let controller = SamplingController::new_at(&config, start);
        controller.record_pipeline_duration(Duration::from_millis(500));

        let now = start + Duration::from_secs(1);
        assert!(!controller.should_record_at(Severity::Warn, &no_attrs(), now));
        assert!(controller.should_record_at(Severity::Error, &no_attrs(), now));
        assert_eq!(controller.decision_count(Gate::Performance, false), 1);
    }

    #[test]
    fn test_zero_and_full_rates() {
        let config = SamplingConfig {
            rates: LevelRates {
                debug: 0.0,
                ..LevelRates::default()
            },
            ..quiet_config()
        };
        let controller = SamplingController::new(&config);

        for _ in 0..50 {
            assert!(!controller.should_record(Severity::Debug, &no_attrs()));
            assert!(controller.should_record(Severity::Info, &no_attrs()));
        }
    }

    #[test]
    fn test_context_multiplier_applies() {
        let config = SamplingConfig {
            rates: LevelRates {
                debug: 0.5,
                ..LevelRates::default()
            },
            contextual_enabled: true,
            high_value_contexts: vec!["payments".to_string()],
            ..quiet_config()
        };
        let controller = SamplingController::new(&config);
        let mut attrs = no_attrs();
        attrs.insert("component".to_string(), json!("payments"));

        // 0.5 x 2.0 reaches certainty.
        for _ in 0..50 {
            assert!(controller.should_record(Severity::Debug, &attrs));
        }

        controller.set_context_rate("payments", 0.0).unwrap();
        assert!(!controller.should_record(Severity::Debug, &attrs));
    }

    #[test]
    fn test_burst_caps_rate() {
        let config = SamplingConfig {
            burst_protection_enabled: true,
            burst_threshold: 3,
            burst_sample_rate: 0.0,
            ..quiet_config()
        };
        let start = Instant::now();
        let controller = SamplingController::new_at(&config, start);

        for _ in 0..3 {
            assert!(controller.should_record_at(Severity::Info, &no_attrs(), start));
        }
        assert!(!controller.should_record_at(Severity::Info, &no_attrs(), start));
        assert_eq!(controller.decision_count(Gate::Burst, false), 1);

        // Bursts are tracked per severity.
        assert!(controller.should_record_at(Severity::Warn, &no_attrs(), start));

        let next_window = start + Duration::from_secs(10);
        assert!(controller.should_record_at(Severity::Info, &no_attrs(), next_window));
    }

    #[test]
    fn test_burst_never_raises_a_lower_rate() {
        let config = SamplingConfig {
            rates: LevelRates {
                info: 0.0,
                ..quiet_config().rates
            },
            burst_protection_enabled: true,
            burst_threshold: 1,
            burst_sample_rate: 1.0,
            ..quiet_config()
        };
        let start = Instant::now();
        let controller = SamplingController::new_at(&config, start);

        for _ in 0..5 {
            assert!(!controller.should_record_at(Severity::Info, &no_attrs(), start));
        }
        assert_eq!(controller.decision_count(Gate::Probability, false), 1);
        assert_eq!(controller.decision_count(Gate::Burst, false), 4);
    }

    #[test]
    fn test_zero_adaptive_window_fails_open() {
        let config = SamplingConfig {
            rates: LevelRates {
                debug: 0.0,
                ..LevelRates::default()
            },
            adaptive_enabled: true,
            adaptive_window_secs: 0,
            ..quiet_config()
        };
        let controller = SamplingController::new(&config);

        assert!(controller.should_record(Severity::Debug, &no_attrs()));
        assert_eq!(controller.decision_count(Gate::FailOpen, true), 1);
    }

    #[test]
    fn test_adaptive_window_counts_every_decision() {
        let config = SamplingConfig {
            adaptive_enabled: true,
            info_rate_limit: Some(1),
            ..quiet_config()
        };
        let start = Instant::now();
        let controller = SamplingController::new_at(&config, start);

        for _ in 0..4 {
            controller.should_record_at(Severity::Info, &no_attrs(), start);
        }

        let stats = controller.stats();
        let (_, info) = stats
            .adaptive
            .iter()
            .find(|(severity, _)| *severity == Severity::Info)
            .unwrap();
        assert_eq!(info.event_count, 4);
        assert_eq!(info.sampled_count, 1);
    }

    #[test]
    fn test_ceiling_caps_base_rates() {
        let controller = SamplingController::new(&quiet_config());
        controller.set_sampling_ceiling(0.0).unwrap();

        assert!(!controller.should_record(Severity::Warn, &no_attrs()));
        assert_eq!(controller.sampling_ceiling(), 0.0);
        assert!(controller.set_sampling_ceiling(1.5).is_err());
    }

    #[test]
    fn test_update_sampling_rates() {
        let controller = SamplingController::new(&quiet_config());
        let rates = LevelRates {
            info: 0.0,
            ..LevelRates::default()
        };

        controller.update_sampling_rates(rates).unwrap();
        assert_eq!(controller.rates().info, 0.0);
        assert!(!controller.should_record(Severity::Info, &no_attrs()));
        assert_eq!(controller.stats().rate_updates, 1);

        let invalid = LevelRates {
            debug: 2.0,
            ..LevelRates::default()
        };
        assert!(controller.update_sampling_rates(invalid).is_err());
        assert_eq!(controller.rates().info, 0.0);
    }

    #[test]
    fn test_concurrent_decisions_are_counted() {
        use std::sync::Arc;

        let controller = Arc::new(SamplingController::new(&quiet_config()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = controller.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        controller.should_record(Severity::Info, &Attributes::new());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(controller.decision_count(Gate::Probability, true), 2000);
    }
}
