//! Configuration management for Tollgate.
//!
//! Every field has a default, so an embedding service can start from
//! `TollgateConfig::default()` and override only what it needs, either in
//! code, from a YAML file, or through `TOLLGATE__*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::sampling::LevelRates;

/// Main configuration for the governance layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Sampling decision configuration
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Background optimizer configuration
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Redaction configuration
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Base sampling probability per severity
    #[serde(default)]
    pub rates: LevelRates,

    /// Events per second allowed at debug level (`None` means unlimited)
    #[serde(default = "default_debug_rate_limit")]
    pub debug_rate_limit: Option<u32>,

    /// Events per second allowed at info level
    #[serde(default = "default_info_rate_limit")]
    pub info_rate_limit: Option<u32>,

    /// Events per second allowed at warn level
    #[serde(default)]
    pub warn_rate_limit: Option<u32>,

    #[serde(default = "default_true")]
    pub adaptive_enabled: bool,

    /// Length of one adaptive window in seconds
    #[serde(default = "default_adaptive_window_secs")]
    pub adaptive_window_secs: u64,

    /// Sampled fraction the adaptive windows steer towards
    #[serde(default = "default_adaptive_target_rate")]
    pub adaptive_target_rate: f64,

    #[serde(default = "default_true")]
    pub contextual_enabled: bool,

    /// Contexts sampled at twice the computed rate
    #[serde(default)]
    pub high_value_contexts: Vec<String>,

    /// Contexts sampled at half the computed rate
    #[serde(default)]
    pub low_value_contexts: Vec<String>,

    /// Explicit context multipliers, applied after the high/low lists
    #[serde(default)]
    pub context_rates: HashMap<String, f64>,

    #[serde(default = "default_true")]
    pub performance_gate_enabled: bool,

    /// Share of wall time the pipeline may consume, in percent
    #[serde(default = "default_max_overhead_percent")]
    pub max_overhead_percent: f64,

    #[serde(default = "default_true")]
    pub burst_protection_enabled: bool,

    /// Events per burst window above which burst sampling kicks in
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u64,

    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,

    /// Rate ceiling while a burst is in progress
    #[serde(default = "default_burst_sample_rate")]
    pub burst_sample_rate: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rates: LevelRates::default(),
            debug_rate_limit: default_debug_rate_limit(),
            info_rate_limit: default_info_rate_limit(),
            warn_rate_limit: None,
            adaptive_enabled: true,
            adaptive_window_secs: default_adaptive_window_secs(),
            adaptive_target_rate: default_adaptive_target_rate(),
            contextual_enabled: true,
            high_value_contexts: Vec::new(),
            low_value_contexts: Vec::new(),
            context_rates: HashMap::new(),
            performance_gate_enabled: true,
            max_overhead_percent: default_max_overhead_percent(),
            burst_protection_enabled: true,
            burst_threshold: default_burst_threshold(),
            burst_window_secs: default_burst_window_secs(),
            burst_sample_rate: default_burst_sample_rate(),
        }
    }
}

impl SamplingConfig {
    pub fn adaptive_window(&self) -> Duration {
        Duration::from_secs(self.adaptive_window_secs)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_debug_rate_limit() -> Option<u32> {
    Some(100)
}

fn default_info_rate_limit() -> Option<u32> {
    Some(1000)
}

fn default_adaptive_window_secs() -> u64 {
    60
}

fn default_adaptive_target_rate() -> f64 {
    0.8
}

fn default_max_overhead_percent() -> f64 {
    2.0
}

fn default_burst_threshold() -> u64 {
    1000
}

fn default_burst_window_secs() -> u64 {
    10
}

fn default_burst_sample_rate() -> f64 {
    0.1
}

/// Optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Resource sampling cadence in milliseconds
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Analysis window in milliseconds; analyzers tick four times per window
    #[serde(default = "default_analysis_window_ms")]
    pub analysis_window_ms: u64,

    /// Optimization cadence in milliseconds
    #[serde(default = "default_optimization_interval_ms")]
    pub optimization_interval_ms: u64,

    #[serde(default = "default_max_utilization")]
    pub max_cpu_percent: f64,

    #[serde(default = "default_max_utilization")]
    pub max_memory_percent: f64,

    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: f64,

    #[serde(default = "default_target_utilization")]
    pub target_cpu_percent: f64,

    #[serde(default = "default_target_utilization")]
    pub target_memory_percent: f64,

    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: f64,

    #[serde(default = "default_true")]
    pub adaptive_batching: bool,

    #[serde(default = "default_true")]
    pub adaptive_sampling: bool,

    #[serde(default = "default_true")]
    pub adaptive_buffering: bool,

    #[serde(default = "default_true")]
    pub resource_optimization: bool,

    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,

    #[serde(default = "default_min_sampling_rate")]
    pub min_sampling_rate: f64,

    #[serde(default = "default_max_sampling_rate")]
    pub max_sampling_rate: f64,

    #[serde(default = "default_min_buffer_size")]
    pub min_buffer_size: usize,

    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,

    /// Capacity of the optimization decision ring
    #[serde(default = "default_decision_history")]
    pub decision_history: usize,

    #[serde(default = "default_throughput_history")]
    pub throughput_history: usize,

    #[serde(default = "default_latency_history")]
    pub latency_history: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            analysis_window_ms: default_analysis_window_ms(),
            optimization_interval_ms: default_optimization_interval_ms(),
            max_cpu_percent: default_max_utilization(),
            max_memory_percent: default_max_utilization(),
            max_latency_ms: default_max_latency_ms(),
            target_cpu_percent: default_target_utilization(),
            target_memory_percent: default_target_utilization(),
            target_latency_ms: default_target_latency_ms(),
            adaptive_batching: true,
            adaptive_sampling: true,
            adaptive_buffering: true,
            resource_optimization: true,
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            initial_batch_size: default_initial_batch_size(),
            min_sampling_rate: default_min_sampling_rate(),
            max_sampling_rate: default_max_sampling_rate(),
            min_buffer_size: default_min_buffer_size(),
            max_buffer_size: default_max_buffer_size(),
            initial_buffer_size: default_initial_buffer_size(),
            decision_history: default_decision_history(),
            throughput_history: default_throughput_history(),
            latency_history: default_latency_history(),
        }
    }
}

impl OptimizerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Analyzers tick four times per analysis window.
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_window_ms / 4)
    }

    pub fn optimization_interval(&self) -> Duration {
        Duration::from_millis(self.optimization_interval_ms)
    }
}

fn default_monitor_interval_ms() -> u64 {
    30_000
}

fn default_analysis_window_ms() -> u64 {
    120_000
}

fn default_optimization_interval_ms() -> u64 {
    300_000
}

fn default_max_utilization() -> f64 {
    80.0
}

fn default_max_latency_ms() -> f64 {
    2000.0
}

fn default_target_utilization() -> f64 {
    60.0
}

fn default_target_latency_ms() -> f64 {
    500.0
}

fn default_min_batch_size() -> usize {
    64
}

fn default_max_batch_size() -> usize {
    4096
}

fn default_initial_batch_size() -> usize {
    512
}

fn default_min_sampling_rate() -> f64 {
    0.01
}

fn default_max_sampling_rate() -> f64 {
    1.0
}

fn default_min_buffer_size() -> usize {
    256
}

fn default_max_buffer_size() -> usize {
    8192
}

fn default_initial_buffer_size() -> usize {
    2048
}

fn default_decision_history() -> usize {
    50
}

fn default_throughput_history() -> usize {
    100
}

fn default_latency_history() -> usize {
    1000
}

/// Redaction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Text substituted for redacted content
    #[serde(default = "default_replacement_token")]
    pub replacement_token: String,

    #[serde(default = "default_true")]
    pub pii_detection: bool,

    #[serde(default = "default_true")]
    pub token_filtering: bool,

    #[serde(default = "default_true")]
    pub url_filtering: bool,

    #[serde(default = "default_true")]
    pub sql_sanitization: bool,

    /// Keys treated as sensitive in addition to the built-in set
    #[serde(default)]
    pub custom_sensitive_keys: Vec<String>,

    /// Identifiers at or below this many characters are fully masked
    #[serde(default = "default_identifier_mask_threshold")]
    pub identifier_mask_threshold: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            replacement_token: default_replacement_token(),
            pii_detection: true,
            token_filtering: true,
            url_filtering: true,
            sql_sanitization: true,
            custom_sensitive_keys: Vec::new(),
            identifier_mask_threshold: default_identifier_mask_threshold(),
        }
    }
}

fn default_replacement_token() -> String {
    "[REDACTED]".to_string()
}

fn default_identifier_mask_threshold() -> usize {
    8
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under
    /// `TOLLGATE__SECTION__FIELD` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject bounds that would make the control loops meaningless.
    pub fn validate(&self) -> Result<()> {
        let s = &self.sampling;
        s.rates.validate()?;
        check_fraction("sampling.adaptive_target_rate", s.adaptive_target_rate)?;
        check_fraction("sampling.burst_sample_rate", s.burst_sample_rate)?;
        for (name, limit) in [
            ("debug", s.debug_rate_limit),
            ("info", s.info_rate_limit),
            ("warn", s.warn_rate_limit),
        ] {
            if limit == Some(0) {
                return Err(TollgateError::Config(format!(
                    "sampling.{name}_rate_limit must be positive or absent"
                )));
            }
        }
        if s.adaptive_window_secs == 0 || s.burst_window_secs == 0 {
            return Err(TollgateError::Config(
                "sampling windows must be non-zero".to_string(),
            ));
        }
        if !(s.max_overhead_percent > 0.0 && s.max_overhead_percent <= 100.0) {
            return Err(TollgateError::Config(format!(
                "sampling.max_overhead_percent must be in (0, 100], got {}",
                s.max_overhead_percent
            )));
        }
        for (key, rate) in &s.context_rates {
            if !rate.is_finite() || *rate < 0.0 {
                return Err(TollgateError::Config(format!(
                    "context rate for {key} must be a non-negative number"
                )));
            }
        }

        let o = &self.optimizer;
        if o.monitor_interval_ms == 0 || o.analysis_window_ms < 4 || o.optimization_interval_ms == 0
        {
            return Err(TollgateError::Config(
                "optimizer intervals must be non-zero".to_string(),
            ));
        }
        if o.monitor_interval() > o.analysis_interval()
            || o.analysis_interval() > o.optimization_interval()
        {
            return Err(TollgateError::Config(
                "optimizer cadences must satisfy monitor <= analysis <= optimization".to_string(),
            ));
        }
        check_bounds("batch_size", o.min_batch_size, o.initial_batch_size, o.max_batch_size)?;
        check_bounds("buffer_size", o.min_buffer_size, o.initial_buffer_size, o.max_buffer_size)?;
        check_fraction("optimizer.min_sampling_rate", o.min_sampling_rate)?;
        check_fraction("optimizer.max_sampling_rate", o.max_sampling_rate)?;
        if o.min_sampling_rate > o.max_sampling_rate {
            return Err(TollgateError::Config(
                "optimizer.min_sampling_rate exceeds max_sampling_rate".to_string(),
            ));
        }
        if o.decision_history == 0 || o.throughput_history == 0 || o.latency_history == 0 {
            return Err(TollgateError::Config(
                "optimizer history capacities must be non-zero".to_string(),
            ));
        }

        if self.security.identifier_mask_threshold < 8 {
            return Err(TollgateError::Config(
                "security.identifier_mask_threshold must be at least 8".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn check_fraction(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(TollgateError::Config(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

fn check_bounds(name: &str, min: usize, initial: usize, max: usize) -> Result<()> {
    if min == 0 || min > initial || initial > max {
        return Err(TollgateError::Config(format!(
            "{name} bounds must satisfy 0 < min <= initial <= max, got {min}/{initial}/{max}"
        )));
    }
    Ok(())
}
