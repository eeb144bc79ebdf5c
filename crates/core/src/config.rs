//! Engine configuration
//!
//! Loaded from TOML. Every table is optional; missing values fall back to the
//! defaults of the corresponding type. Durations are integer milliseconds.
//!
//! ```toml
//! [engine]
//! default_timeout_ms = 10000
//!
//! [global]
//! reservoir = 1000
//! refresh_amount = 1000
//! refresh_interval_ms = 60000
//!
//! [scopes.spotify]
//! max_concurrent = 4
//! min_time_ms = 100
//!
//! [retry]
//! preset = "robust"
//! max_attempts = 4
//!
//! [cache]
//! cleanup_interval_ms = 60000
//!
//! [cache.types.track_metadata]
//! ttl_ms = 300000
//! max = 500
//! strategy = "stale-while-revalidate"
//!
//! [logging]
//! format = "json"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use relaygate_common::{
    duration_millis, init_tracing, option_duration_millis, EngineError, EngineResult, TracingConfig,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{Cache, CacheTypeConfig};
use crate::engine::{EngineOptions, DEFAULT_TIMEOUT};
use crate::limiter::{RateLimiterConfig, ScopeConfig};
use crate::retry::{RetryPolicy, RetryPolicyBuilder, RetryPreset};

/// `[engine]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    #[serde(rename = "default_timeout_ms", with = "duration_millis")]
    pub default_timeout: Duration,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self { default_timeout: DEFAULT_TIMEOUT }
    }
}

/// `[retry]` table: a preset plus optional field overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Starting point for the policy
    pub preset: RetryPreset,
    /// Overrides the preset's attempt count
    pub max_attempts: Option<u32>,
    #[serde(rename = "base_delay_ms", with = "option_duration_millis")]
    pub base_delay: Option<Duration>,
    #[serde(rename = "max_delay_ms", with = "option_duration_millis")]
    pub max_delay: Option<Duration>,
    /// Overrides the preset's growth factor
    pub backoff_factor: Option<f64>,
    /// Overrides the preset's jitter flag
    pub jitter: Option<bool>,
    /// Overrides whether retry-after replaces backoff
    pub honor_retry_after: Option<bool>,
}

impl RetrySection {
    /// Preset policy with the overrides applied
    pub fn policy(&self) -> EngineResult<RetryPolicy> {
        let mut builder = RetryPolicyBuilder::from_preset(self.preset);
        if let Some(attempts) = self.max_attempts {
            builder = builder.max_attempts(attempts);
        }
        if let Some(delay) = self.base_delay {
            builder = builder.base_delay(delay);
        }
        if let Some(delay) = self.max_delay {
            builder = builder.max_delay(delay);
        }
        if let Some(factor) = self.backoff_factor {
            builder = builder.backoff_factor(factor);
        }
        if let Some(jitter) = self.jitter {
            builder = builder.jitter(jitter);
        }
        if let Some(honor) = self.honor_retry_after {
            builder = builder.honor_retry_after(honor);
        }
        builder.build()
    }
}

/// `[cache]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Period of the expiry sweep; no sweep when absent
    #[serde(rename = "cleanup_interval_ms", with = "option_duration_millis")]
    pub cleanup_interval: Option<Duration>,
    /// Cache types keyed by name
    pub types: BTreeMap<String, CacheTypeConfig>,
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `[engine]`
    pub engine: EngineSection,
    /// `[global]`: limits shared by every scope
    pub global: ScopeConfig,
    /// `[default_scope]`: limits for scopes registered lazily
    pub default_scope: Option<ScopeConfig>,
    /// `[scopes.<name>]`
    pub scopes: BTreeMap<String, ScopeConfig>,
    /// `[retry]`
    pub retry: RetrySection,
    /// `[cache]`
    pub cache: CacheSection,
    /// `[logging]`, applied by [`init_logging`](Self::init_logging)
    pub logging: TracingConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| EngineError::config(format!("invalid engine configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("cannot read {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loading engine configuration");
        Self::from_toml_str(&source)
    }

    /// Encode back to TOML
    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string(self).map_err(|e| EngineError::config(format!("cannot encode configuration: {}", e)))
    }

    /// Check every section, naming the offending table in the error
    pub fn validate(&self) -> EngineResult<()> {
        if self.engine.default_timeout.is_zero() {
            return Err(EngineError::config_field("engine.default_timeout_ms", "must be greater than zero"));
        }
        self.global.validate().map_err(|e| in_section("global", e))?;
        if let Some(default_scope) = &self.default_scope {
            default_scope.validate().map_err(|e| in_section("default_scope", e))?;
        }
        for (name, scope) in &self.scopes {
            scope.validate().map_err(|e| in_section(&format!("scopes.{}", name), e))?;
        }
        self.retry.policy().map_err(|e| in_section("retry", e))?;
        if self.cache.cleanup_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(EngineError::config_field("cache.cleanup_interval_ms", "must be greater than zero"));
        }
        for (name, cache_type) in &self.cache.types {
            cache_type.validate().map_err(|e| in_section(&format!("cache.types.{}", name), e))?;
        }
        Ok(())
    }

    /// Install the tracing subscriber described by `[logging]`.
    ///
    /// Call once from the host before building the engine; later calls keep
    /// the subscriber already in place.
    pub fn init_logging(&self) -> EngineResult<()> {
        init_tracing(&self.logging)
    }

    /// Global and default-scope limits for the rate limiter
    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig { global: self.global.clone(), default_scope: self.default_scope.clone() }
    }

    /// Engine defaults from `[engine]` and `[retry]`
    pub fn engine_options(&self) -> EngineResult<EngineOptions> {
        Ok(EngineOptions { default_timeout: self.engine.default_timeout, retry_policy: self.retry.policy()? })
    }

    /// Cache with every configured type; starts the expiry sweep when
    /// `cleanup_interval_ms` is set, which requires a tokio runtime.
    pub fn build_cache<V>(&self) -> EngineResult<Cache<V>>
    where
        V: Clone + Serialize + Send + Sync + 'static,
    {
        let cache = Cache::new();
        for (name, cache_type) in &self.cache.types {
            cache.configure_type(name, cache_type.clone())?;
        }
        if let Some(interval) = self.cache.cleanup_interval {
            cache.start_cleanup(interval)?;
        }
        Ok(cache)
    }
}

fn in_section(section: &str, err: EngineError) -> EngineError {
    match err {
        EngineError::Configuration { message, field } => EngineError::Configuration {
            message,
            field: Some(match field {
                Some(field) => format!("{}.{}", section, field),
                None => section.to_string(),
            }),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use relaygate_common::LogFormat;

    use super::*;
    use crate::cache::CacheStrategy;

    /// Validates that the `[logging]` table drives subscriber setup and that
    /// repeated setup is harmless.
    #[test]
    fn test_init_logging_from_config() {
        let config = EngineConfig::from_toml_str(
            r#"
            [logging]
            filter = "relaygate_core=debug"
            format = "json"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.logging.format, LogFormat::Json);

        config.init_logging().expect("first init");
        config.init_logging().expect("second init");
        EngineConfig::default().init_logging().expect("default logging");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.engine.default_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_full_document() {
        let source = r#"
            [engine]
            default_timeout_ms = 5000

            [global]
            reservoir = 50
            refresh_amount = 50
            refresh_interval_ms = 1000

            [scopes.spotify]
            max_concurrent = 2
            min_time_ms = 100

            [retry]
            preset = "robust"
            max_attempts = 4
            jitter = false

            [cache.types.tracks]
            ttl_ms = 200
            max = 5
            strategy = "network-first"

            [logging]
            format = "json"
        "#;
        let config = EngineConfig::from_toml_str(source).expect("valid config");

        assert_eq!(config.engine.default_timeout, Duration::from_secs(5));
        assert_eq!(config.global.capacity, 50);
        let spotify = &config.scopes["spotify"];
        assert_eq!(spotify.max_concurrent, 2);
        assert_eq!(spotify.min_spacing, Duration::from_millis(100));

        let policy = config.retry.policy().expect("valid policy");
        assert_eq!(policy.max_attempts, 4);
        assert!(!policy.jitter);
        assert_eq!(policy.max_delay, Duration::from_secs(30));

        let tracks = &config.cache.types["tracks"];
        assert_eq!(tracks.max_entries, 5);
        assert_eq!(tracks.strategy, CacheStrategy::NetworkFirst);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    /// Validates that errors name the table they came from.
    #[test]
    fn test_invalid_scope_names_section() {
        let err = EngineConfig::from_toml_str("[scopes.youtube]\nmax_concurrent = 0\n").expect_err("invalid scope");
        match err {
            EngineError::Configuration { field, .. } => {
                assert_eq!(field.as_deref(), Some("scopes.youtube.max_concurrent"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_toml_is_configuration_error() {
        let err = EngineConfig::from_toml_str("[engine\n").expect_err("malformed");
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[test]
    fn test_toml_encoding_reloads() {
        let mut config = EngineConfig::default();
        config.scopes.insert("soundcloud".to_string(), ScopeConfig::default());
        let encoded = config.to_toml_string().expect("encodes");
        assert_eq!(EngineConfig::from_toml_str(&encoded).expect("reloads"), config);
    }
}
