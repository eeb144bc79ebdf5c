//! Per-scope call metrics
//!
//! Counters only grow until [`MetricsRegistry::reset`]. Latency is kept as a
//! running total so the average is exact for the recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::scope::Scope;

#[derive(Debug, Default)]
struct ScopeCounters {
    requested: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    latency_total_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl ScopeCounters {
    fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_total_us.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, scope: &Scope) -> ScopeMetricsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total = self.latency_total_us.load(Ordering::Relaxed);
        ScopeMetricsSnapshot {
            scope: scope.clone(),
            requested: self.requested.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            average_latency: if samples == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total / samples)
            },
        }
    }
}

/// Point-in-time view of one scope's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeMetricsSnapshot {
    /// Scope the counters belong to
    pub scope: Scope,
    /// Calls submitted
    pub requested: u64,
    /// Calls that succeeded
    pub completed: u64,
    /// Calls that failed, timeouts included
    pub failed: u64,
    /// Retries across all calls
    pub retried: u64,
    /// Calls that hit their deadline
    pub timed_out: u64,
    #[serde(with = "relaygate_common::duration_millis")]
    pub average_latency: Duration,
}

impl ScopeMetricsSnapshot {
    /// Completed / (completed + failed), 0.0 when nothing finished
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }
}

/// Registry of per-scope counters
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    scopes: Arc<Mutex<HashMap<Scope, Arc<ScopeCounters>>>>,
}

impl MetricsRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, scope: &Scope) -> Arc<ScopeCounters> {
        Arc::clone(self.scopes.lock().entry(scope.clone()).or_default())
    }

    /// Count a submitted call
    pub fn record_request(&self, scope: &Scope) {
        self.counters(scope).requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a success and its latency
    pub fn record_success(&self, scope: &Scope, latency: Duration) {
        let counters = self.counters(scope);
        counters.completed.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(latency);
    }

    /// Count a failure and its latency
    pub fn record_failure(&self, scope: &Scope, latency: Duration) {
        let counters = self.counters(scope);
        counters.failed.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(latency);
    }

    /// A timed-out call also counts as failed
    pub fn record_timeout(&self, scope: &Scope, latency: Duration) {
        self.counters(scope).timed_out.fetch_add(1, Ordering::Relaxed);
        self.record_failure(scope, latency);
    }

    /// Count one retry
    pub fn record_retry(&self, scope: &Scope) {
        self.counters(scope).retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for one scope
    pub fn snapshot(&self, scope: &Scope) -> Option<ScopeMetricsSnapshot> {
        self.scopes.lock().get(scope).map(|counters| counters.snapshot(scope))
    }

    /// Snapshots for every scope seen, sorted by scope name
    pub fn all(&self) -> Vec<ScopeMetricsSnapshot> {
        let mut snapshots: Vec<_> =
            self.scopes.lock().iter().map(|(scope, counters)| counters.snapshot(scope)).collect();
        snapshots.sort_by(|a, b| a.scope.cmp(&b.scope));
        snapshots
    }

    /// Forget every scope
    pub fn reset(&self) {
        self.scopes.lock().clear();
    }
}
