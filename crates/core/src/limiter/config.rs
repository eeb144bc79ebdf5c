//! Scope and limiter configuration

use std::time::Duration;

use relaygate_common::{duration_millis, EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Quota for one scope: a refilling reservoir plus concurrency and spacing caps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Minimum time between two admissions in this scope (zero disables)
    #[serde(rename = "min_time_ms", with = "duration_millis")]
    pub min_spacing: Duration,
    /// Maximum admitted-but-unfinished units
    pub max_concurrent: u32,
    /// Reservoir size (tokens)
    #[serde(rename = "reservoir")]
    pub capacity: u64,
    /// Tokens added per elapsed refill interval
    #[serde(rename = "refresh_amount")]
    pub refill_amount: u64,
    #[serde(rename = "refresh_interval_ms", with = "duration_millis")]
    pub refill_interval: Duration,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::ZERO,
            max_concurrent: 10,
            capacity: 100,
            refill_amount: 100,
            refill_interval: Duration::from_secs(60),
        }
    }
}

impl ScopeConfig {
    /// Create a new configuration builder
    pub fn builder() -> ScopeConfigBuilder {
        ScopeConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_concurrent == 0 {
            return Err(EngineError::config_field("max_concurrent", "must be greater than 0"));
        }
        if self.capacity == 0 {
            return Err(EngineError::config_field("reservoir", "must be greater than 0"));
        }
        if self.refill_amount == 0 {
            return Err(EngineError::config_field("refresh_amount", "must be greater than 0"));
        }
        if self.refill_interval.is_zero() {
            return Err(EngineError::config_field(
                "refresh_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Builder for [`ScopeConfig`]
#[derive(Debug, Default)]
pub struct ScopeConfigBuilder {
    config: ScopeConfig,
}

impl ScopeConfigBuilder {
    /// Builder starting from the defaults
    pub fn new() -> Self {
        Self { config: ScopeConfig::default() }
    }

    /// Minimum time between two admissions
    pub fn min_spacing(mut self, spacing: Duration) -> Self {
        self.config.min_spacing = spacing;
        self
    }

    /// Maximum items executing at once
    pub fn max_concurrent(mut self, max: u32) -> Self {
        self.config.max_concurrent = max;
        self
    }

    /// Reservoir size
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Tokens added per refill interval
    pub fn refill_amount(mut self, amount: u64) -> Self {
        self.config.refill_amount = amount;
        self
    }

    /// Time between refills
    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.config.refill_interval = interval;
        self
    }

    /// Set capacity and refill amount to the same value
    pub fn reservoir(self, tokens: u64, every: Duration) -> Self {
        self.capacity(tokens).refill_amount(tokens).refill_interval(every)
    }

    /// Validate and return the config
    pub fn build(self) -> EngineResult<ScopeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Limiter-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Quota shared by every scope
    pub global: ScopeConfig,
    /// Applied to scopes seen without explicit registration; when absent,
    /// unknown scopes are rejected
    pub default_scope: Option<ScopeConfig>,
}

impl RateLimiterConfig {
    /// Check the global scope and, when set, the default scope
    pub fn validate(&self) -> EngineResult<()> {
        self.global.validate()?;
        if let Some(default_scope) = &self.default_scope {
            default_scope.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validates() {
        let err = ScopeConfig::builder().max_concurrent(0).build().expect_err("zero concurrency");
        assert!(err.to_string().contains("max_concurrent"));

        let err = ScopeConfig::builder()
            .refill_interval(Duration::ZERO)
            .build()
            .expect_err("zero interval");
        assert!(err.to_string().contains("refresh_interval_ms"));
    }

    #[test]
    fn test_zero_spacing_is_valid() {
        let config = ScopeConfig::builder()
            .min_spacing(Duration::ZERO)
            .reservoir(3, Duration::from_millis(1000))
            .build()
            .expect("valid config");
        assert_eq!(config.capacity, 3);
        assert_eq!(config.refill_amount, 3);
    }

    /// Validates the option names used in configuration files.
    #[test]
    fn test_deserialize_option_names() {
        let json = r#"{"min_time_ms":100,"max_concurrent":2,"reservoir":3,
            "refresh_amount":3,"refresh_interval_ms":1000}"#;
        let config: ScopeConfig = serde_json::from_str(json).expect("Should deserialize");
        assert_eq!(config.min_spacing, Duration::from_millis(100));
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.refill_interval, Duration::from_secs(1));
        config.validate().expect("valid");
    }
}
