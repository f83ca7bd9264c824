//! Metrics registry for one stream processor.
//!
//! Counters only, monotonic, reset on instance creation. All values use
//! relaxed atomics; exactness under concurrent snapshots is not required.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Operational counters for one partition's engine instance.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Commands fully processed, including replayed ones.
    records_processed: AtomicU64,
    /// Commands skipped because no handler was registered.
    records_skipped: AtomicU64,
    /// Commands reapplied during recovery.
    records_replayed: AtomicU64,
    /// Follow-up records appended to the log.
    follow_ups_written: AtomicU64,
    /// Iterations retried after a transient failure.
    retries: AtomicU64,
    /// Recovery attempts.
    recovery_runs: AtomicU64,
    /// Recovery attempts that failed.
    recovery_failures: AtomicU64,
    /// Transitions into the failed phase.
    engine_failures: AtomicU64,
    /// Duration of the most recent successful recovery, in milliseconds.
    last_recovery_duration_ms: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replayed(&self) {
        self.records_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_follow_ups_written(&self, count: u64) {
        self.follow_ups_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recovery_runs(&self) {
        self.recovery_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recovery_failures(&self) {
        self.recovery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_engine_failures(&self) {
        self.engine_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the wall-clock duration of a successful recovery.
    pub fn observe_recovery_duration(&self, duration: Duration) {
        self.last_recovery_duration_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            records_replayed: self.records_replayed.load(Ordering::Relaxed),
            follow_ups_written: self.follow_ups_written.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            recovery_runs: self.recovery_runs.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            engine_failures: self.engine_failures.load(Ordering::Relaxed),
            last_recovery_duration_ms: self.last_recovery_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_processed: u64,
    pub records_skipped: u64,
    pub records_replayed: u64,
    pub follow_ups_written: u64,
    pub retries: u64,
    pub recovery_runs: u64,
    pub recovery_failures: u64,
    pub engine_failures: u64,
    pub last_recovery_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let snapshot = EngineMetrics::new().snapshot();
        assert_eq!(snapshot.records_processed, 0);
        assert_eq!(snapshot.recovery_runs, 0);
        assert_eq!(snapshot.last_recovery_duration_ms, 0);
    }

    #[test]
    fn test_increments_are_visible_in_snapshot() {
        let metrics = EngineMetrics::new();
        metrics.increment_processed();
        metrics.increment_processed();
        metrics.increment_skipped();
        metrics.add_follow_ups_written(3);
        metrics.observe_recovery_duration(Duration::from_millis(120));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_processed, 2);
        assert_eq!(snapshot.records_skipped, 1);
        assert_eq!(snapshot.follow_ups_written, 3);
        assert_eq!(snapshot.last_recovery_duration_ms, 120);
    }
}
