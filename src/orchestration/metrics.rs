//! # Workflow Metrics
//!
//! Counters for step outcomes, redirects and contention. One instance is
//! created per engine and handed to the components that record into it, so
//! tests get isolated counters.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkflowMetrics {
    steps_started: AtomicU64,
    steps_succeeded: AtomicU64,
    steps_failed: AtomicU64,
    redirects_issued: AtomicU64,
    redirect_alternations: AtomicU64,
    persistence_failures_logged: AtomicU64,
    lock_timeouts: AtomicU64,
    concurrency_conflicts: AtomicU64,
    failures_by_step: Mutex<BTreeMap<String, u64>>,
}

/// Point-in-time copy of [`WorkflowMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMetricsSnapshot {
    pub steps_started: u64,
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub redirects_issued: u64,
    pub redirect_alternations: u64,
    pub persistence_failures_logged: u64,
    pub lock_timeouts: u64,
    pub concurrency_conflicts: u64,
    pub failures_by_step: BTreeMap<String, u64>,
}

impl WorkflowMetricsSnapshot {
    /// Fraction of finished steps that failed (0.0 when nothing finished)
    pub fn failure_rate(&self) -> f64 {
        let finished = self.steps_succeeded + self.steps_failed;
        if finished == 0 {
            return 0.0;
        }
        self.steps_failed as f64 / finished as f64
    }
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_step_started(&self) {
        self.steps_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step_succeeded(&self) {
        self.steps_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step_failed(&self, step: &str) {
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
        *self
            .failures_by_step
            .lock()
            .entry(step.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_redirect(&self, alternated: bool) {
        self.redirects_issued.fetch_add(1, Ordering::Relaxed);
        if alternated {
            self.redirect_alternations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures_logged
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_concurrency_conflict(&self) {
        self.concurrency_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkflowMetricsSnapshot {
        WorkflowMetricsSnapshot {
            steps_started: self.steps_started.load(Ordering::Relaxed),
            steps_succeeded: self.steps_succeeded.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            redirects_issued: self.redirects_issued.load(Ordering::Relaxed),
            redirect_alternations: self.redirect_alternations.load(Ordering::Relaxed),
            persistence_failures_logged: self.persistence_failures_logged.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            concurrency_conflicts: self.concurrency_conflicts.load(Ordering::Relaxed),
            failures_by_step: self.failures_by_step.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent_per_instance() {
        let a = WorkflowMetrics::new();
        let b = WorkflowMetrics::new();
        a.record_step_started();
        a.record_step_failed("build_image");
        a.record_step_failed("build_image");
        a.record_redirect(true);

        let snapshot = a.snapshot();
        assert_eq!(snapshot.steps_started, 1);
        assert_eq!(snapshot.failures_by_step["build_image"], 2);
        assert_eq!(snapshot.redirect_alternations, 1);
        assert_eq!(b.snapshot(), WorkflowMetricsSnapshot::default());
    }

    #[test]
    fn test_failure_rate() {
        let metrics = WorkflowMetrics::new();
        assert_eq!(metrics.snapshot().failure_rate(), 0.0);
        metrics.record_step_succeeded();
        metrics.record_step_succeeded();
        metrics.record_step_succeeded();
        metrics.record_step_failed("push_image");
        assert!((metrics.snapshot().failure_rate() - 0.25).abs() < f64::EPSILON);
    }
}
