//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a task finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    runs_dispatched: AtomicU64,
    runs_retried: AtomicU64,
    runs_invalid: AtomicU64,
    clustering_passes: AtomicU64,
    tasks_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_dispatched: AtomicU64::new(0),
            runs_retried: AtomicU64::new(0),
            runs_invalid: AtomicU64::new(0),
            clustering_passes: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_dispatched(&self) {
        self.runs_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_dispatched", "counter incremented");
    }

    pub fn inc_runs_retried(&self) {
        self.runs_retried.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_retried", "counter incremented");
    }

    pub fn inc_runs_invalid(&self) {
        self.runs_invalid.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_invalid", "counter incremented");
    }

    pub fn inc_clustering_passes(&self) {
        self.clustering_passes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "clustering_passes", "counter incremented");
    }

    pub fn inc_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tasks_failed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_dispatched = self.runs_dispatched(),
            runs_retried = self.runs_retried(),
            runs_invalid = self.runs_invalid(),
            clustering_passes = self.clustering_passes(),
            tasks_failed = self.tasks_failed(),
        );
    }

    pub fn runs_dispatched(&self) -> u64 {
        self.runs_dispatched.load(Ordering::Relaxed)
    }

    pub fn runs_retried(&self) -> u64 {
        self.runs_retried.load(Ordering::Relaxed)
    }

    pub fn runs_invalid(&self) -> u64 {
        self.runs_invalid.load(Ordering::Relaxed)
    }

    pub fn clustering_passes(&self) -> u64 {
        self.clustering_passes.load(Ordering::Relaxed)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.runs_dispatched.store(0, Ordering::Relaxed);
        self.runs_retried.store(0, Ordering::Relaxed);
        self.runs_invalid.store(0, Ordering::Relaxed);
        self.clustering_passes.store(0, Ordering::Relaxed);
        self.tasks_failed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_runs_dispatched();
        m.inc_runs_dispatched();
        m.inc_runs_retried();
        m.inc_runs_invalid();
        m.inc_clustering_passes();
        assert_eq!(m.runs_dispatched(), 2);
        assert_eq!(m.runs_retried(), 1);
        assert_eq!(m.runs_invalid(), 1);
        assert_eq!(m.clustering_passes(), 1);
        assert_eq!(m.tasks_failed(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_runs_dispatched();
        m.inc_tasks_failed();
        m.reset();
        assert_eq!(m.runs_dispatched(), 0);
        assert_eq!(m.tasks_failed(), 0);
    }
}
