//! Error-class-aware retry with exponential backoff
//!
//! [`RetryManager::execute_with_retry`] re-runs an operation while its
//! [`RetryPolicy`] accepts the error and attempts remain:
//!
//! 1. attempt `n` runs (racing the operation's cancellation token)
//! 2. on failure the policy's predicate classifies the error
//! 3. the `on_retry` hook is notified, then the manager waits
//!    `min(base * factor^(n-1), max)` ± 10% jitter, or the server's
//!    retry-after when one is present
//! 4. attempt `n + 1` runs
//!
//! In-flight operations are tracked by id so callers can inspect them
//! ([`RetryManager::retry_state`]) or cancel them ([`RetryManager::cancel`]).

mod policy;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relaygate_common::{Clock, EngineError, SystemClock};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

pub use policy::{RetryCondition, RetryHook, RetryPolicy, RetryPolicyBuilder, RetryPreset};

/// Terminal failure of a retried operation
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryError {
    /// The last error observed, or `Cancelled`
    #[source]
    pub error: EngineError,
    /// Attempts started, including the failed one
    pub attempts: u32,
}

/// Snapshot of an in-flight retried operation
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Caller-supplied or generated identifier
    pub operation_id: String,
    /// Attempt currently running or last finished
    pub attempt: u32,
    /// Attempt budget from the policy
    pub max_attempts: u32,
    /// Time since the first attempt started
    pub elapsed: Duration,
    /// Most recent failure, if any
    pub last_error: Option<EngineError>,
}

/// Aggregate retry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Operations started
    pub operations: u64,
    /// Operations that eventually succeeded
    pub succeeded: u64,
    /// Operations that failed permanently or ran out of attempts
    pub failed: u64,
    /// Individual retries (backoff waits)
    pub retried: u64,
    /// Operations cancelled mid-flight
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    operations: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
}

impl RetryCounters {
    fn snapshot(&self) -> RetryStats {
        RetryStats {
            operations: self.operations.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [&self.operations, &self.succeeded, &self.failed, &self.retried, &self.cancelled] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
struct ActiveRetry {
    attempt: u32,
    max_attempts: u32,
    started_at: Instant,
    last_error: Option<EngineError>,
    token: CancellationToken,
}

struct Inner<C> {
    clock: C,
    active: Mutex<HashMap<String, ActiveRetry>>,
    counters: RetryCounters,
}

/// Executes operations under retry policies and tracks them by id
///
/// Cheap to clone; clones share tracking state and counters.
pub struct RetryManager<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for RetryManager<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Default for RetryManager<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryManager<SystemClock> {
    /// Manager on the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<C: Clock> RetryManager<C> {
    /// Manager waiting on `clock`
    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                active: Mutex::new(HashMap::new()),
                counters: RetryCounters::default(),
            }),
        }
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts or is cancelled.
    ///
    /// `operation_id` must be unique among in-flight operations. An invalid
    /// `policy` fails with a configuration error before any attempt.
    #[instrument(skip(self, policy, operation), fields(max_attempts = policy.max_attempts))]
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        policy.validate().map_err(|error| RetryError { error, attempts: 0 })?;
        let token = self.register(operation_id, policy.max_attempts).map_err(|error| RetryError { error, attempts: 0 })?;
        let _guard = ActiveGuard { manager: self, operation_id };
        self.inner.counters.operations.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(self.cancelled(operation_id, attempt - 1));
            }
            self.update(operation_id, |state| state.attempt = attempt);
            debug!(attempt, "Executing attempt");

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled(operation_id, attempt)),
                result = operation() => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    self.inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.update(operation_id, |state| state.last_error = Some(err.clone()));

            if !policy.should_retry(&err) {
                debug!(attempt, error = %err, error.kind = err.kind().as_str(), "Error not retryable");
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(RetryError { error: err, attempts: attempt });
            }
            if attempt >= policy.max_attempts {
                error!(attempts = attempt, error = %err, "Retry attempts exhausted");
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(RetryError { error: err, attempts: attempt });
            }

            let delay = policy.delay_for(attempt, &err);
            self.inner.counters.retried.fetch_add(1, Ordering::Relaxed);
            policy.notify_retry(&err, attempt);
            warn!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled(operation_id, attempt)),
                _ = self.inner.clock.sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn register(&self, operation_id: &str, max_attempts: u32) -> Result<CancellationToken, EngineError> {
        let mut active = self.inner.active.lock();
        if active.contains_key(operation_id) {
            return Err(EngineError::config_field(
                "operation_id",
                format!("operation '{}' is already in flight", operation_id),
            ));
        }
        let token = CancellationToken::new();
        active.insert(
            operation_id.to_string(),
            ActiveRetry {
                attempt: 0,
                max_attempts,
                started_at: self.inner.clock.now(),
                last_error: None,
                token: token.clone(),
            },
        );
        Ok(token)
    }

    fn update(&self, operation_id: &str, apply: impl FnOnce(&mut ActiveRetry)) {
        if let Some(state) = self.inner.active.lock().get_mut(operation_id) {
            apply(state);
        }
    }

    fn cancelled(&self, operation_id: &str, attempts: u32) -> RetryError {
        self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(attempts, "Retry cancelled");
        RetryError { error: EngineError::cancelled(operation_id), attempts }
    }

    /// State of an in-flight operation
    pub fn retry_state(&self, operation_id: &str) -> Option<RetryState> {
        let now = self.inner.clock.now();
        self.inner.active.lock().get(operation_id).map(|state| RetryState {
            operation_id: operation_id.to_string(),
            attempt: state.attempt,
            max_attempts: state.max_attempts,
            elapsed: now.saturating_duration_since(state.started_at),
            last_error: state.last_error.clone(),
        })
    }

    /// Ids of all in-flight operations
    pub fn active_retries(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel an in-flight operation; returns whether it was found
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.inner.active.lock().get(operation_id) {
            Some(state) => {
                state.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight operation; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let active = self.inner.active.lock();
        for state in active.values() {
            state.token.cancel();
        }
        active.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> RetryStats {
        self.inner.counters.snapshot()
    }

    /// Zero every counter
    pub fn reset_stats(&self) {
        self.inner.counters.reset();
    }
}

/// Removes the operation from tracking when the retry loop ends or is dropped
struct ActiveGuard<'a, C: Clock> {
    manager: &'a RetryManager<C>,
    operation_id: &'a str,
}

impl<C: Clock> Drop for ActiveGuard<'_, C> {
    fn drop(&mut self) {
        self.manager.inner.active.lock().remove(self.operation_id);
    }
}
