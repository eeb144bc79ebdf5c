//! Retry policies, presets and delay computation

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use relaygate_common::{EngineError, EngineResult, ErrorClassification, ErrorKind};
use serde::{Deserialize, Serialize};

/// Predicate deciding whether an error is worth another attempt
pub type RetryCondition = Arc<dyn Fn(&EngineError) -> bool + Send + Sync>;

/// Hook invoked before each backoff wait with the error and the attempt that failed
pub type RetryHook = Arc<dyn Fn(&EngineError, u32, &RetryPolicy) + Send + Sync>;

/// Fraction of the computed delay used as the jitter range (±10%)
const JITTER_RATIO: f64 = 0.1;

/// Named policy presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    /// Light operations: few attempts, short delays
    Fast,
    /// Regular API calls
    #[default]
    Standard,
    /// Critical operations: more attempts, timeouts retried too
    Robust,
    /// Large uploads/downloads: long delays, gentle growth
    FileTransfer,
    /// Token and login calls: credential failures are never retried
    Authentication,
}

impl RetryPreset {
    /// The policy this preset stands for
    pub fn policy(self) -> RetryPolicy {
        match self {
            Self::Fast => RetryPolicy::fast(),
            Self::Standard => RetryPolicy::standard(),
            Self::Robust => RetryPolicy::robust(),
            Self::FileTransfer => RetryPolicy::file_transfer(),
            Self::Authentication => RetryPolicy::authentication(),
        }
    }
}

/// How and when a failed operation is re-attempted
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any single wait, retry-after included
    pub max_delay: Duration,
    /// Growth per attempt; must be at least 1.0
    pub backoff_factor: f64,
    /// Add a uniform ±10% offset to computed delays
    pub jitter: bool,
    /// Let a server-provided retry-after replace the computed delay
    pub honor_retry_after: bool,
    retry_condition: RetryCondition,
    on_retry: Option<RetryHook>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("honor_retry_after", &self.honor_retry_after)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn retryable(err: &EngineError) -> bool {
    err.is_retryable()
}

fn retryable_or_timeout(err: &EngineError) -> bool {
    err.is_retryable() || err.kind() == ErrorKind::Timeout
}

fn transport_only(err: &EngineError) -> bool {
    matches!(err.kind(), ErrorKind::Network | ErrorKind::RateLimited)
}

impl RetryPolicy {
    fn preset(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter: bool,
        condition: fn(&EngineError) -> bool,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_factor,
            jitter,
            honor_retry_after: true,
            retry_condition: Arc::new(condition),
            on_retry: None,
        }
    }

    /// 2 attempts, 500ms..2s
    pub fn fast() -> Self {
        Self::preset(2, Duration::from_millis(500), Duration::from_secs(2), 2.0, true, retryable)
    }

    /// 3 attempts, 1s..10s, doubling
    pub fn standard() -> Self {
        Self::preset(3, Duration::from_secs(1), Duration::from_secs(10), 2.0, true, retryable)
    }

    /// 5 attempts, 2s..30s; timeouts are retried as well
    pub fn robust() -> Self {
        Self::preset(5, Duration::from_secs(2), Duration::from_secs(30), 2.0, true, retryable_or_timeout)
    }

    /// 3 attempts, 5s..60s, factor 1.5; timeouts are retried as well
    pub fn file_transfer() -> Self {
        Self::preset(3, Duration::from_secs(5), Duration::from_secs(60), 1.5, true, retryable_or_timeout)
    }

    /// 2 attempts, 1s..5s; only transport and rate-limit failures are retried
    pub fn authentication() -> Self {
        Self::preset(2, Duration::from_secs(1), Duration::from_secs(5), 2.0, false, transport_only)
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self::preset(1, Duration::from_millis(1), Duration::from_millis(1), 1.0, false, |_| false)
    }

    /// Builder starting from the standard preset
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Replace the retry predicate
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&EngineError) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Arc::new(condition);
        self
    }

    /// Install a hook called before each backoff wait
    pub fn with_on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EngineError, u32, &RetryPolicy) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Check the bounds every delay computation relies on.
    ///
    /// Fields are public, so the retry loop re-runs this before the first
    /// attempt.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::config_field("max_attempts", "must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(EngineError::config_field("base_delay_ms", "must be greater than zero"));
        }
        if self.max_delay < self.base_delay {
            return Err(EngineError::config_field("max_delay_ms", "must not be below base_delay_ms"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(EngineError::config_field("backoff_factor", "must be a finite value >= 1.0"));
        }
        Ok(())
    }

    /// Whether `err` qualifies for another attempt under this policy
    pub fn should_retry(&self, err: &EngineError) -> bool {
        (self.retry_condition)(err)
    }

    /// `min(base_delay * backoff_factor^(attempt-1), max_delay)`, without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Wait before re-attempting after `attempt` failed with `err`.
    ///
    /// A server-specified retry-after (capped at `max_delay`) replaces the
    /// computed backoff and is not jittered.
    pub fn delay_for(&self, attempt: u32, err: &EngineError) -> Duration {
        if self.honor_retry_after {
            if let Some(retry_after) = err.retry_after() {
                return retry_after.min(self.max_delay);
            }
        }

        let delay = self.backoff_delay(attempt);
        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// Run the on-retry hook; a panicking hook is logged and ignored
    pub(crate) fn notify_retry(&self, err: &EngineError, attempt: u32) {
        let Some(hook) = &self.on_retry else {
            return;
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(err, attempt, self)));
        if outcome.is_err() {
            tracing::warn!(attempt, "on_retry hook panicked; continuing retry loop");
        }
    }
}

/// Uniform offset within ±10% of `delay`, clamped at zero
fn apply_jitter(delay: Duration) -> Duration {
    let base = delay.as_secs_f64();
    let offset = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO) * base;
    Duration::from_secs_f64((base + offset).max(0.0))
}

/// Builder for [`RetryPolicy`], starting from a preset
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    /// Start from the standard preset
    pub fn new() -> Self {
        Self { policy: RetryPolicy::standard() }
    }

    /// Start from `preset`
    pub fn from_preset(preset: RetryPreset) -> Self {
        Self { policy: preset.policy() }
    }

    /// Total attempts including the first one
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Delay after the first failure
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Cap for every wait
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Multiplier applied per attempt
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.policy.backoff_factor = factor;
        self
    }

    /// Enable or disable ±10% jitter
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    /// Let a server retry-after replace the computed delay
    pub fn honor_retry_after(mut self, enabled: bool) -> Self {
        self.policy.honor_retry_after = enabled;
        self
    }

    /// Replace the retry predicate
    pub fn retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&EngineError) -> bool + Send + Sync + 'static,
    {
        self.policy = self.policy.with_condition(condition);
        self
    }

    /// Hook called before each backoff wait
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EngineError, u32, &RetryPolicy) + Send + Sync + 'static,
    {
        self.policy = self.policy.with_on_retry(hook);
        self
    }

    /// Validate and return the policy
    pub fn build(self) -> EngineResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}
