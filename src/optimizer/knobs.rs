//! Exporter-facing tuning knobs.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::info;

use super::controller::{Action, OptimizationDecision, ReclaimMode};
use crate::error::{Result, TollgateError};

/// Receiver of optimization decisions on the exporter side.
///
/// Sampling-rate decisions are applied to the sampling controller by the
/// optimizer itself before being handed to the target.
#[async_trait]
pub trait TuningTarget: Send + Sync {
    /// Apply one decision.
    async fn apply(&self, decision: &OptimizationDecision) -> Result<()>;
}

/// Snapshot of the knob values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KnobSnapshot {
    pub batch_size: usize,
    pub buffer_size: usize,
    pub reclaim_mode: ReclaimMode,
    pub reclaim_requests: u64,
}

/// Lock-free knobs read by exporters on their own schedule.
pub struct ExporterKnobs {
    batch_size: AtomicUsize,
    buffer_size: AtomicUsize,
    aggressive_reclaim: AtomicBool,
    reclaim_requests: AtomicU64,
}

impl ExporterKnobs {
    pub fn new(batch_size: usize, buffer_size: usize) -> Self {
        Self {
            batch_size: AtomicUsize::new(batch_size),
            buffer_size: AtomicUsize::new(buffer_size),
            aggressive_reclaim: AtomicBool::new(false),
            reclaim_requests: AtomicU64::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Relaxed)
    }

    pub fn reclaim_mode(&self) -> ReclaimMode {
        if self.aggressive_reclaim.load(Ordering::Relaxed) {
            ReclaimMode::Aggressive
        } else {
            ReclaimMode::Normal
        }
    }

    /// Number of times aggressive reclaim has been requested.
    pub fn reclaim_requests(&self) -> u64 {
        self.reclaim_requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> KnobSnapshot {
        KnobSnapshot {
            batch_size: self.batch_size(),
            buffer_size: self.buffer_size(),
            reclaim_mode: self.reclaim_mode(),
            reclaim_requests: self.reclaim_requests(),
        }
    }
}

fn mismatch(decision: &OptimizationDecision) -> TollgateError {
    TollgateError::Apply {
        action: decision.action.to_string(),
        reason: format!("unexpected value {:?}", decision.new_value),
    }
}

#[async_trait]
impl TuningTarget for ExporterKnobs {
    async fn apply(&self, decision: &OptimizationDecision) -> Result<()> {
        match decision.action {
            Action::AdjustBatchSize => {
                let size = decision.new_value.as_size().ok_or_else(|| mismatch(decision))?;
                self.batch_size.store(size, Ordering::Relaxed);
                info!(batch_size = size, "Batch size adjusted");
            }
            Action::AdjustBufferSize => {
                let size = decision.new_value.as_size().ok_or_else(|| mismatch(decision))?;
                self.buffer_size.store(size, Ordering::Relaxed);
                info!(buffer_size = size, "Buffer size adjusted");
            }
            Action::SetReclaimMode => {
                let mode = decision.new_value.as_mode().ok_or_else(|| mismatch(decision))?;
                let aggressive = mode == ReclaimMode::Aggressive;
                self.aggressive_reclaim.store(aggressive, Ordering::Relaxed);
                if aggressive {
                    self.reclaim_requests.fetch_add(1, Ordering::Relaxed);
                }
                info!(mode = ?mode, "Reclaim mode set");
            }
            // Owned by the sampling controller.
            Action::AdjustSamplingRate => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::optimizer::controller::{AdaptiveController, Observations, ParamValue};

    fn decisions_for(cpu: f64, memory: f64) -> Vec<OptimizationDecision> {
        AdaptiveController::new(&OptimizerConfig::default()).decide(&Observations {
            cpu_percent: cpu,
            memory_percent: memory,
            ..Observations::default()
        })
    }

    #[tokio::test]
    async fn test_apply_batch_size() {
        let knobs = ExporterKnobs::new(512, 2048);
        for decision in decisions_for(95.0, 10.0) {
            knobs.apply(&decision).await.unwrap();
        }
        assert_eq!(knobs.batch_size(), 409);
        assert_eq!(knobs.buffer_size(), 2048);
    }

    #[tokio::test]
    async fn test_apply_memory_decisions() {
        let knobs = ExporterKnobs::new(512, 2048);
        for decision in decisions_for(10.0, 95.0) {
            knobs.apply(&decision).await.unwrap();
        }

        let snapshot = knobs.snapshot();
        assert_eq!(snapshot.reclaim_mode, ReclaimMode::Aggressive);
        assert_eq!(snapshot.reclaim_requests, 1);
        assert_eq!(snapshot.buffer_size, 1536);
    }

    #[test]
    fn test_mismatched_value_is_an_apply_error() {
        let knobs = ExporterKnobs::new(512, 2048);
        let mut decision = decisions_for(95.0, 10.0).remove(0);
        decision.new_value = ParamValue::Rate(0.5);

        let err = tokio_test::block_on(knobs.apply(&decision)).unwrap_err();
        assert!(matches!(err, TollgateError::Apply { .. }));
        assert_eq!(knobs.batch_size(), 512);
    }
}
