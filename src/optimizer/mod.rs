//! Closed-loop performance optimization.
//!
//! The optimizer owns three background loops:
//! - monitor: samples CPU, memory and task counts
//! - analysis: recomputes throughput and latency statistics
//! - optimization: turns the latest statistics into decisions and applies them
//!
//! Loops are started together, share one shutdown channel and are joined on
//! [`PerformanceOptimizer::stop`].

mod controller;
mod knobs;
mod latency;
mod monitor;
mod throughput;

pub use controller::{
    Action, AdaptiveController, Observations, OptimizationDecision, ParamValue, ReclaimMode,
    TunedParameters,
};
pub use knobs::{ExporterKnobs, KnobSnapshot, TuningTarget};
pub use latency::{LatencyAnalyzer, LatencyStats};
pub use monitor::{ResourceMonitor, ResourceProbe, ResourceSnapshot, SysinfoProbe};
pub use throughput::{ThroughputAnalyzer, ThroughputStats};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::OptimizerConfig;
use crate::error::{Result, TollgateError};
use crate::sampling::SamplingController;

/// Snapshot of the optimizer state.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStats {
    pub running: bool,
    pub cycles: u64,
    pub applied: u64,
    pub apply_failures: u64,
    pub resources: ResourceSnapshot,
    pub throughput: ThroughputStats,
    pub latency: LatencyStats,
    pub parameters: TunedParameters,
}

enum RunState {
    Stopped,
    Running {
        shutdown: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
    },
}

struct OptimizerInner {
    monitor: ResourceMonitor,
    throughput: ThroughputAnalyzer,
    latency: LatencyAnalyzer,
    controller: AdaptiveController,
    sampling: Arc<SamplingController>,
    target: Arc<dyn TuningTarget>,
    cycles: AtomicU64,
    applied: AtomicU64,
    apply_failures: AtomicU64,
}

/// Supervisor of the tuning loops.
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    inner: Arc<OptimizerInner>,
    state: Mutex<RunState>,
}

impl PerformanceOptimizer {
    pub fn new(
        config: &OptimizerConfig,
        sampling: Arc<SamplingController>,
        target: Arc<dyn TuningTarget>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let inner = OptimizerInner {
            monitor: ResourceMonitor::new(probe),
            throughput: ThroughputAnalyzer::new(config.throughput_history),
            latency: LatencyAnalyzer::new(config.latency_history),
            controller: AdaptiveController::new(config),
            sampling,
            target,
            cycles: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            apply_failures: AtomicU64::new(0),
        };

        Self {
            config: config.clone(),
            inner: Arc::new(inner),
            state: Mutex::new(RunState::Stopped),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), RunState::Running { .. })
    }

    /// Spawn the background loops on the current tokio runtime.
    ///
    /// Starting an optimizer that is already running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(*state, RunState::Running { .. }) {
            debug!("Performance optimizer already running");
            return Ok(());
        }

        tokio::runtime::Handle::try_current()
            .map_err(|e| TollgateError::Runtime(e.to_string()))?;

        let (shutdown, receiver) = watch::channel(false);

        let monitor = {
            let inner = self.inner.clone();
            spawn_loop("monitor", self.config.monitor_interval(), receiver.clone(), move || {
                inner.monitor.sample();
                async {}
            })
        };

        let analysis = {
            let inner = self.inner.clone();
            spawn_loop("analysis", self.config.analysis_interval(), receiver.clone(), move || {
                inner.throughput.tick();
                inner.latency.tick();
                async {}
            })
        };

        let optimization = {
            let inner = self.inner.clone();
            spawn_loop("optimization", self.config.optimization_interval(), receiver, move || {
                let inner = inner.clone();
                async move {
                    inner.run_cycle().await;
                }
            })
        };

        *state = RunState::Running {
            shutdown,
            tasks: vec![monitor, analysis, optimization],
        };

        info!(
            monitor_ms = self.config.monitor_interval_ms,
            analysis_ms = self.config.analysis_interval().as_millis() as u64,
            optimization_ms = self.config.optimization_interval_ms,
            "Performance optimizer started"
        );
        Ok(())
    }

    /// Signal every loop to stop and wait for them to finish.
    pub async fn stop(&self) {
        let state = std::mem::replace(&mut *self.state.lock(), RunState::Stopped);
        let RunState::Running { shutdown, tasks } = state else {
            return;
        };

        let _ = shutdown.send(true);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Optimizer loop ended abnormally");
            }
        }
        info!("Performance optimizer stopped");
    }

    pub fn record_latency(&self, latency: Duration) {
        self.inner.latency.record(latency);
    }

    pub fn record_served_event(&self) {
        self.inner.throughput.record_event();
    }

    pub fn record_reclaim_pause(&self, pause: Duration) {
        self.inner.monitor.record_reclaim_pause(pause);
    }

    /// Run one monitor cycle immediately.
    pub fn sample_resources(&self) -> ResourceSnapshot {
        self.inner.monitor.sample()
    }

    /// Run one analysis cycle immediately.
    pub fn analyze(&self) -> (ThroughputStats, LatencyStats) {
        (self.inner.throughput.tick(), self.inner.latency.tick())
    }

    /// Run one optimization cycle immediately.
    pub async fn optimize(&self) -> Vec<OptimizationDecision> {
        self.inner.run_cycle().await
    }

    pub fn decision_history(&self) -> Vec<OptimizationDecision> {
        self.inner.controller.history()
    }

    pub fn stats(&self) -> OptimizerStats {
        let inner = &self.inner;
        OptimizerStats {
            running: self.is_running(),
            cycles: inner.cycles.load(Ordering::Relaxed),
            applied: inner.applied.load(Ordering::Relaxed),
            apply_failures: inner.apply_failures.load(Ordering::Relaxed),
            resources: inner.monitor.latest(),
            throughput: inner.throughput.stats(),
            latency: inner.latency.stats(),
            parameters: inner.controller.parameters(),
        }
    }
}

impl Drop for PerformanceOptimizer {
    fn drop(&mut self) {
        // Loops exit on their own once signalled; they cannot be joined here.
        if let RunState::Running { shutdown, .. } = &*self.state.lock() {
            let _ = shutdown.send(true);
        }
    }
}

impl OptimizerInner {
    async fn run_cycle(&self) -> Vec<OptimizationDecision> {
        let resources = self.monitor.latest();
        let observed = Observations {
            cpu_percent: resources.cpu_percent,
            memory_percent: resources.memory_percent,
            mean_latency_ms: self.latency.stats().mean_ms(),
        };

        let decisions = self.controller.decide(&observed);
        for decision in &decisions {
            match self.apply(decision).await {
                Ok(()) => {
                    self.applied.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.apply_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        action = %decision.action,
                        error = %e,
                        "Failed to apply optimization decision"
                    );
                }
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        decisions
    }

    async fn apply(&self, decision: &OptimizationDecision) -> Result<()> {
        if decision.action == Action::AdjustSamplingRate {
            let rate = decision.new_value.as_rate().ok_or_else(|| TollgateError::Apply {
                action: decision.action.to_string(),
                reason: format!("unexpected value {:?}", decision.new_value),
            })?;
            self.sampling
                .set_sampling_ceiling(rate)
                .map_err(|e| TollgateError::Apply {
                    action: decision.action.to_string(),
                    reason: e.to_string(),
                })?;
        }
        self.target.apply(decision).await
    }
}

/// Run `tick` every `period` until the shutdown channel fires or closes.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        // The first tick fires one full period after start.
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!(task = name, "Optimizer loop stopped");
    })
}
