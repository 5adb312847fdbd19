//! The governance object handed to call sites.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TollgateConfig;
use crate::error::Result;
use crate::event::{Attributes, Event, GovernedEvent};
use crate::optimizer::{
    ExporterKnobs, KnobSnapshot, OptimizationDecision, OptimizerStats, PerformanceOptimizer,
    ResourceProbe, SysinfoProbe,
};
use crate::sampling::{LevelRates, SamplingController, SamplingStats, Severity};
use crate::security::SecurityFilter;

/// Combined statistics of one governor.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStats {
    pub id: Uuid,
    pub sampling: SamplingStats,
    pub optimizer: OptimizerStats,
    pub knobs: KnobSnapshot,
}

/// Wires sampling, redaction and optimization together.
///
/// Each governor is independent; tests and embedding services can create as
/// many as they need. Foreground calls never block on I/O.
pub struct Governor {
    id: Uuid,
    sampling: Arc<SamplingController>,
    security: Arc<SecurityFilter>,
    knobs: Arc<ExporterKnobs>,
    optimizer: PerformanceOptimizer,
}

impl Governor {
    /// Build a governor probing resources through `sysinfo`.
    pub fn new(config: TollgateConfig) -> Result<Self> {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    /// Build a governor with a custom resource probe.
    pub fn with_probe(config: TollgateConfig, probe: Arc<dyn ResourceProbe>) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let sampling = Arc::new(SamplingController::new(&config.sampling));
        let security = Arc::new(SecurityFilter::new(&config.security)?);
        let knobs = Arc::new(ExporterKnobs::new(
            config.optimizer.initial_batch_size,
            config.optimizer.initial_buffer_size,
        ));
        let optimizer =
            PerformanceOptimizer::new(&config.optimizer, sampling.clone(), knobs.clone(), probe);

        info!(governor_id = %id, "Governor created");

        Ok(Self {
            id,
            sampling,
            security,
            knobs,
            optimizer,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start the background optimizer. Requires a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.optimizer.start()
    }

    /// Stop the background optimizer and wait for its loops to finish.
    pub async fn shutdown(&self) {
        self.optimizer.stop().await;
        info!(governor_id = %self.id, "Governor shut down");
    }

    pub fn should_record(&self, severity: Severity, attributes: &Attributes) -> bool {
        self.sampling.should_record(severity, attributes)
    }

    pub fn sanitize(&self, attributes: &Attributes) -> Attributes {
        self.security.sanitize(attributes)
    }

    pub fn sanitize_message(&self, message: &str) -> String {
        self.security.sanitize_message(message)
    }

    /// Decide on an event and sanitize it if it is recorded.
    ///
    /// The time spent here counts towards the pipeline overhead budget.
    pub fn govern(&self, event: Event) -> Option<GovernedEvent> {
        let start = Instant::now();
        let governed = self.govern_inner(event);
        self.sampling.record_pipeline_duration(start.elapsed());
        governed
    }

    fn govern_inner(&self, event: Event) -> Option<GovernedEvent> {
        if !self.sampling.should_record(event.severity, &event.attributes) {
            return None;
        }

        let security = &self.security;
        Some(GovernedEvent {
            severity: event.severity,
            message: security.sanitize_message(&event.message),
            attributes: security.sanitize(&event.attributes),
            trace_id: event.trace_id.as_deref().map(|id| security.sanitize_identifier(id)),
            user_id: event.user_id.as_deref().map(|id| security.sanitize_identifier(id)),
            request_id: event.request_id.as_deref().map(|id| security.sanitize_identifier(id)),
        })
    }

    /// Feed an observed request latency to the optimizer.
    pub fn record_observed_latency(&self, latency: Duration) {
        self.optimizer.record_latency(latency);
    }

    /// Count one served request for throughput analysis.
    pub fn record_observed_throughput_event(&self) {
        self.optimizer.record_served_event();
    }

    pub fn record_reclaim_pause(&self, pause: Duration) {
        self.optimizer.record_reclaim_pause(pause);
    }

    pub fn add_sensitive_key(&self, key: &str) {
        self.security.add_sensitive_key(key);
    }

    pub fn remove_sensitive_key(&self, key: &str) -> bool {
        self.security.remove_sensitive_key(key)
    }

    pub fn set_replacement_token(&self, token: &str) -> Result<()> {
        self.security.set_replacement_token(token)
    }

    pub fn update_sampling_rates(&self, rates: LevelRates) -> Result<()> {
        debug!(governor_id = %self.id, "Updating sampling rates");
        self.sampling.update_sampling_rates(rates)
    }

    /// Knobs read by exporters.
    pub fn knobs(&self) -> Arc<ExporterKnobs> {
        self.knobs.clone()
    }

    pub fn decision_history(&self) -> Vec<OptimizationDecision> {
        self.optimizer.decision_history()
    }

    pub fn sampling(&self) -> &SamplingController {
        &self.sampling
    }

    pub fn security(&self) -> &SecurityFilter {
        &self.security
    }

    pub fn optimizer(&self) -> &PerformanceOptimizer {
        &self.optimizer
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            id: self.id,
            sampling: self.sampling.stats(),
            optimizer: self.optimizer.stats(),
            knobs: self.knobs.snapshot(),
        }
    }
}
