//! Request orchestration
//!
//! [`Engine`] is the single entry point provider adapters call. Every call:
//!
//! 1. is admitted by the [`RateLimiter`] under its scope (and the global scope),
//! 2. runs inside the [`RetryManager`], re-entering admission on every retry,
//! 3. races an overall timeout covering queueing, attempts and backoff,
//! 4. is recorded in the [`MetricsRegistry`].
//!
//! Failures come back as [`CallError`], which keeps the underlying
//! [`EngineError`] kind together with the scope, operation and attempt count.

mod error;

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relaygate_common::observability::log_error;
use relaygate_common::{Clock, EngineError, EngineResult, SystemClock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use error::CallError;

use crate::cache::{Cache, CacheStrategy};
use crate::config::EngineConfig;
use crate::limiter::{RateLimiter, RateLimiterConfig, ScopeConfig, WorkItem, DEFAULT_PRIORITY};
use crate::metrics::{MetricsRegistry, ScopeMetricsSnapshot};
use crate::retry::{RetryError, RetryManager, RetryPolicy, RetryStats};
use crate::scope::Scope;

/// Default overall deadline for one call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine-wide defaults applied when a [`CallContext`] does not override them
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Deadline for calls without their own timeout
    pub default_timeout: Duration,
    /// Policy for calls without their own policy
    pub retry_policy: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { default_timeout: DEFAULT_TIMEOUT, retry_policy: RetryPolicy::standard() }
    }
}

impl EngineOptions {
    /// Reject a zero timeout or an invalid policy
    pub fn validate(&self) -> EngineResult<()> {
        if self.default_timeout.is_zero() {
            return Err(EngineError::config_field("default_timeout_ms", "must be greater than zero"));
        }
        self.retry_policy.validate()
    }
}

/// Describes one API call
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Scope the call is admitted under
    pub scope: Scope,
    /// Operation name used in logs and errors
    pub operation: String,
    /// Identifier for retry tracking and cancellation; generated when absent
    pub operation_id: Option<String>,
    /// Admission priority, lower first
    pub priority: u32,
    /// Reservoir tokens consumed per attempt
    pub weight: u64,
    /// Give up if not admitted by this instant
    pub expiration: Option<Instant>,
    /// Overrides the engine's default timeout
    pub timeout: Option<Duration>,
    /// Overrides the engine's default retry policy
    pub policy: Option<RetryPolicy>,
}

impl CallContext {
    /// Call in `scope` with default priority and weight
    pub fn new(scope: impl Into<Scope>, operation: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            operation: operation.into(),
            operation_id: None,
            priority: DEFAULT_PRIORITY,
            weight: 1,
            expiration: None,
            timeout: None,
            policy: None,
        }
    }

    /// Fix the operation id, e.g. to cancel the call later
    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    /// Set the admission priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the reservoir weight
    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    /// Give up if still queued at `expiration`
    pub fn with_expiration(mut self, expiration: Instant) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Overall deadline for this call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry policy for this call
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    fn work_item(&self) -> WorkItem {
        WorkItem { priority: self.priority, weight: self.weight, expiration: self.expiration }
    }
}

/// Limiter, retry and call metrics in one snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Per-scope call metrics, sorted by scope
    pub scopes: Vec<ScopeMetricsSnapshot>,
    /// Retry manager counters
    pub retry: RetryStats,
    /// Operations currently inside the retry loop
    pub active_retries: usize,
}

type CleanupStop = Box<dyn Fn() + Send + Sync>;

struct Inner<C: Clock> {
    clock: C,
    limiter: RateLimiter<C>,
    retry: RetryManager<C>,
    metrics: MetricsRegistry,
    options: EngineOptions,
    shutdown: CancellationToken,
    attached_caches: Mutex<Vec<CleanupStop>>,
}

/// Orchestrator composing rate limiting, retry, timeout and metrics
pub struct Engine<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for Engine<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Engine<SystemClock> {
    /// Engine on the system clock
    pub fn new(limiter: RateLimiterConfig, options: EngineOptions) -> EngineResult<Self> {
        Self::with_clock(limiter, options, SystemClock)
    }

    /// Build an engine and register every scope listed in `config`
    pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let engine = Self::new(config.limiter_config(), config.engine_options()?)?;
        for (name, scope_config) in &config.scopes {
            engine.configure_scope(Scope::new(name), scope_config.clone())?;
        }
        info!(scopes = config.scopes.len(), "Engine created from configuration");
        Ok(engine)
    }
}

impl<C: Clock + Clone> Engine<C> {
    /// Engine whose limiter, retry waits and timeouts read `clock`
    pub fn with_clock(limiter: RateLimiterConfig, options: EngineOptions, clock: C) -> EngineResult<Self> {
        options.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                limiter: RateLimiter::with_clock(limiter, clock.clone())?,
                retry: RetryManager::with_clock(clock.clone()),
                clock,
                metrics: MetricsRegistry::new(),
                options,
                shutdown: CancellationToken::new(),
                attached_caches: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl<C: Clock> Engine<C> {
    /// Register or replace a scope's limits
    pub fn configure_scope(&self, scope: Scope, config: ScopeConfig) -> EngineResult<()> {
        self.inner.limiter.configure(scope, config)
    }

    /// Underlying rate limiter
    pub fn limiter(&self) -> &RateLimiter<C> {
        &self.inner.limiter
    }

    /// Underlying retry manager
    pub fn retry_manager(&self) -> &RetryManager<C> {
        &self.inner.retry
    }

    /// Call metrics registry
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    /// Defaults applied to every call
    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Run `operation` under the call's scope limits, retry policy and timeout.
    ///
    /// `operation` is invoked once per attempt, before that attempt's
    /// admission; only the returned future waits for the rate limiter. Keep
    /// side effects inside the future, since an attempt that expires or is
    /// cancelled while queued never polls it. When the timeout fires first,
    /// the in-flight attempt is dropped and the call fails with a `Timeout`
    /// error.
    #[instrument(skip_all, fields(scope = %ctx.scope, operation = %ctx.operation))]
    pub async fn execute_api_call<F, Fut, T>(&self, ctx: CallContext, mut operation: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let started = self.inner.clock.now();
        let metrics = &self.inner.metrics;
        metrics.record_request(&ctx.scope);

        if self.inner.shutdown.is_cancelled() {
            let err = EngineError::cancelled_with_reason(ctx.operation.as_str(), "engine is shut down");
            return Err(self.failed(&ctx, 0, started, err));
        }

        let policy = ctx.policy.as_ref().unwrap_or(&self.inner.options.retry_policy);
        let timeout = ctx.timeout.unwrap_or(self.inner.options.default_timeout);
        let operation_id = ctx
            .operation_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}:{}", ctx.scope, ctx.operation, Uuid::new_v4()));

        let started_attempts = AtomicU32::new(0);
        let run = {
            let limiter = &self.inner.limiter;
            let scope = &ctx.scope;
            let item = ctx.work_item();
            let started_attempts = &started_attempts;
            self.inner.retry.execute_with_retry(&operation_id, policy, move || {
                if started_attempts.fetch_add(1, Ordering::Relaxed) > 0 {
                    metrics.record_retry(scope);
                }
                let attempt = operation();
                limiter.schedule(scope, item.clone(), move || attempt)
            })
        };

        let outcome = tokio::select! {
            biased;
            result = run => Some(result),
            _ = self.inner.clock.sleep(timeout) => None,
        };

        let elapsed = self.inner.clock.since(started);
        match outcome {
            Some(Ok(value)) => {
                metrics.record_success(&ctx.scope, elapsed);
                debug!(elapsed_ms = elapsed.as_millis() as u64, "Call succeeded");
                Ok(value)
            }
            Some(Err(RetryError { error, attempts })) => Err(self.failed(&ctx, attempts, started, error)),
            None => {
                let attempts = started_attempts.load(Ordering::Relaxed);
                metrics.record_timeout(&ctx.scope, elapsed);
                warn!(timeout_ms = timeout.as_millis() as u64, attempts, "Call timed out");
                Err(CallError {
                    scope: ctx.scope.clone(),
                    operation: ctx.operation.clone(),
                    attempts,
                    elapsed,
                    source: EngineError::timeout(ctx.operation.as_str(), timeout),
                })
            }
        }
    }

    fn failed(&self, ctx: &CallContext, attempts: u32, started: Instant, source: EngineError) -> CallError {
        let elapsed = self.inner.clock.since(started);
        self.inner.metrics.record_failure(&ctx.scope, elapsed);
        log_error(&source, &format!("{} on {}", ctx.operation, ctx.scope));
        CallError { scope: ctx.scope.clone(), operation: ctx.operation.clone(), attempts, elapsed, source }
    }

    /// Resolve `key` through `cache` using `strategy`, calling the API through
    /// [`execute_api_call`](Self::execute_api_call) whenever a fetch is needed.
    ///
    /// Returns `Ok(None)` only for a `CacheOnly` miss.
    pub async fn execute_cached<V, F, Fut>(
        &self,
        cache: &Cache<V, C>,
        cache_type: &str,
        key: &str,
        strategy: CacheStrategy,
        ctx: CallContext,
        operation: F,
    ) -> EngineResult<Option<V>>
    where
        V: Clone + Serialize + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<V>> + Send + 'static,
    {
        let engine = self.clone();
        cache
            .fetch_with_strategy(cache_type, key, strategy, move || async move {
                engine.execute_api_call(ctx, operation).await.map_err(EngineError::from)
            })
            .await
    }

    /// Stop `cache`'s cleanup task when this engine shuts down
    pub fn attach_cache<V>(&self, cache: &Cache<V, C>)
    where
        V: Clone + Serialize + Send + Sync + 'static,
    {
        let cache = cache.clone();
        self.inner.attached_caches.lock().push(Box::new(move || cache.stop_cleanup()));
    }

    /// Per-scope call metrics (sorted by scope) and retry counters
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            scopes: self.inner.metrics.all(),
            retry: self.inner.retry.stats(),
            active_retries: self.inner.retry.active_retries().len(),
        }
    }

    /// Metrics for one scope, if it has seen calls
    pub fn scope_stats(&self, scope: &Scope) -> Option<ScopeMetricsSnapshot> {
        self.inner.metrics.snapshot(scope)
    }

    /// Clear call metrics and retry counters
    pub fn reset_stats(&self) {
        self.inner.metrics.reset();
        self.inner.retry.reset_stats();
    }

    /// Cancel in-flight calls, stop attached cache cleanup and reject new calls
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let cancelled = self.inner.retry.cancel_all();
        for stop in self.inner.attached_caches.lock().drain(..) {
            stop();
        }
        info!(cancelled, "Engine shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for call orchestration.
    use relaygate_common::testing::ScriptedOperation;
    use relaygate_common::ErrorKind;

    use super::*;

    fn engine() -> Engine {
        let engine = Engine::new(RateLimiterConfig::default(), EngineOptions::default()).expect("engine");
        engine
            .configure_scope(Scope::new("api"), ScopeConfig::default())
            .expect("configure scope");
        engine
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(10))
            .jitter(false)
            .build()
            .expect("valid policy")
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_records_metrics() {
        let engine = engine();
        let value = engine
            .execute_api_call(CallContext::new("api", "get"), || async { Ok::<_, EngineError>(42) })
            .await
            .expect("call succeeds");
        assert_eq!(value, 42);

        let stats = engine.scope_stats(&Scope::new("api")).expect("recorded");
        assert_eq!((stats.requested, stats.completed, stats.failed), (1, 1, 0));
    }

    /// Validates that a retried call counts its retries and attempts.
    #[tokio::test(start_paused = true)]
    async fn test_retry_counts_attempts() {
        let engine = engine();
        let script = ScriptedOperation::failing_then(2, EngineError::network("reset"), "ok");
        let ctx = CallContext::new("api", "get").with_policy(quick_policy(3));

        let value = engine.execute_api_call(ctx, || script.invoke()).await.expect("third attempt succeeds");
        assert_eq!(value, "ok");
        assert_eq!(script.calls(), 3);

        let stats = engine.scope_stats(&Scope::new("api")).expect("recorded");
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_enhanced() {
        let engine = engine();
        let ctx = CallContext::new("api", "login").with_policy(quick_policy(3));
        let err = engine
            .execute_api_call(ctx, || async { Err::<(), _>(EngineError::authentication("bad token")) })
            .await
            .expect_err("authentication is not retried");

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.scope, Scope::new("api"));
        assert_eq!(err.operation, "login");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_scope_is_configuration_error() {
        let engine = engine();
        let err = engine
            .execute_api_call(CallContext::new("nowhere", "get"), || async { Ok::<_, EngineError>(()) })
            .await
            .expect_err("scope is not configured");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    /// Validates that a per-call policy broken after `build()` surfaces as a
    /// configuration error instead of reaching the backoff computation.
    #[tokio::test(start_paused = true)]
    async fn test_invalid_call_policy_is_configuration_error() {
        let engine = engine();
        let mut policy = quick_policy(3);
        policy.backoff_factor = -2.0;
        let script = ScriptedOperation::<()>::always_failing(EngineError::network("reset"));

        let err = engine
            .execute_api_call(CallContext::new("api", "get").with_policy(policy), || script.invoke())
            .await
            .expect_err("policy is invalid");

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.attempts, 0);
        assert_eq!(script.calls(), 0);
        let stats = engine.scope_stats(&Scope::new("api")).expect("recorded");
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_rejected_after_shutdown() {
        let engine = engine();
        engine.shutdown();
        assert!(engine.is_shut_down());

        let err = engine
            .execute_api_call(CallContext::new("api", "get"), || async { Ok::<_, EngineError>(()) })
            .await
            .expect_err("engine is shut down");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.attempts, 0);
    }

    #[test]
    fn test_options_validation() {
        let options = EngineOptions { default_timeout: Duration::ZERO, ..Default::default() };
        assert!(Engine::new(RateLimiterConfig::default(), options).is_err());
    }
}
