//! Resource sampling.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tracing::trace;

/// Source of raw resource readings.
pub trait ResourceProbe: Send + Sync {
    /// Process-wide CPU utilization in percent.
    fn cpu_percent(&self) -> f64;

    /// Used memory in percent of the available total.
    fn memory_percent(&self) -> f64;

    /// Number of concurrently alive tasks.
    fn task_count(&self) -> usize;
}

/// Probe backed by `sysinfo` and the current tokio runtime's metrics.
///
/// CPU usage is computed between two consecutive refreshes, so the first
/// reading after construction may be zero.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn cpu_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        f64::from(system.global_cpu_usage())
    }

    fn memory_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        (system.used_memory() as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }

    fn task_count(&self) -> usize {
        tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_alive_tasks())
            .unwrap_or(0)
    }
}

/// One resource reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub tasks: usize,
    /// Duration of the most recent memory reclaim pause reported by the host
    pub reclaim_pause: Duration,
    /// `None` until the first sample has been taken
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Keeps the latest resource snapshot.
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    latest: RwLock<ResourceSnapshot>,
    reclaim_pause_nanos: AtomicU64,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            latest: RwLock::new(ResourceSnapshot::default()),
            reclaim_pause_nanos: AtomicU64::new(0),
        }
    }

    /// Take a fresh reading and make it the latest snapshot.
    pub fn sample(&self) -> ResourceSnapshot {
        let snapshot = ResourceSnapshot {
            cpu_percent: self.probe.cpu_percent(),
            memory_percent: self.probe.memory_percent(),
            tasks: self.probe.task_count(),
            reclaim_pause: Duration::from_nanos(self.reclaim_pause_nanos.load(Ordering::Relaxed)),
            sampled_at: Some(Utc::now()),
        };

        trace!(
            cpu = snapshot.cpu_percent,
            memory = snapshot.memory_percent,
            tasks = snapshot.tasks,
            "Resource snapshot"
        );

        *self.latest.write() = snapshot;
        snapshot
    }

    /// Latest snapshot; all zero before the first sample.
    pub fn latest(&self) -> ResourceSnapshot {
        *self.latest.read()
    }

    /// Report the duration of a reclaim pause observed by the host.
    pub fn record_reclaim_pause(&self, pause: Duration) {
        let nanos = u64::try_from(pause.as_nanos()).unwrap_or(u64::MAX);
        self.reclaim_pause_nanos.store(nanos, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Probe returning fixed readings that tests can change.
    #[derive(Default)]
    pub(crate) struct FixedProbe {
        cpu: AtomicU64,
        memory: AtomicU64,
        tasks: AtomicUsize,
    }

    impl FixedProbe {
        pub(crate) fn new(cpu: f64, memory: f64) -> Self {
            let probe = Self::default();
            probe.set(cpu, memory);
            probe
        }

        pub(crate) fn set(&self, cpu: f64, memory: f64) {
            self.cpu.store(cpu.to_bits(), Ordering::Relaxed);
            self.memory.store(memory.to_bits(), Ordering::Relaxed);
        }
    }

    impl ResourceProbe for FixedProbe {
        fn cpu_percent(&self) -> f64 {
            f64::from_bits(self.cpu.load(Ordering::Relaxed))
        }

        fn memory_percent(&self) -> f64 {
            f64::from_bits(self.memory.load(Ordering::Relaxed))
        }

        fn task_count(&self) -> usize {
            self.tasks.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn test_latest_is_empty_before_first_sample() {
        let monitor = ResourceMonitor::new(Arc::new(FixedProbe::new(50.0, 40.0)));
        let latest = monitor.latest();
        assert_eq!(latest.cpu_percent, 0.0);
        assert!(latest.sampled_at.is_none());
    }

    #[test]
    fn test_sample_updates_latest() {
        let probe = Arc::new(FixedProbe::new(95.0, 40.0));
        let monitor = ResourceMonitor::new(probe.clone());
        monitor.record_reclaim_pause(Duration::from_millis(3));

        let snapshot = monitor.sample();
        assert_eq!(snapshot.cpu_percent, 95.0);
        assert_eq!(snapshot.memory_percent, 40.0);
        assert_eq!(snapshot.reclaim_pause, Duration::from_millis(3));
        assert_eq!(monitor.latest(), snapshot);

        probe.set(10.0, 20.0);
        assert_eq!(monitor.latest().cpu_percent, 95.0);
        assert_eq!(monitor.sample().cpu_percent, 10.0);
    }

    #[test]
    fn test_sysinfo_probe_reports_bounded_memory() {
        let probe = SysinfoProbe::new();
        let memory = probe.memory_percent();
        assert!((0.0..=100.0).contains(&memory));
        assert_eq!(probe.task_count(), 0);
    }

    #[tokio::test]
    async fn test_sysinfo_probe_counts_runtime_tasks() {
        let probe = SysinfoProbe::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(probe.task_count() >= 1);
        handle.abort();
    }
}
