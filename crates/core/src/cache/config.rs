//! Cache type configuration

use std::time::Duration;

use relaygate_common::{duration_millis, EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// How `fetch_with_strategy` combines cached data and the upstream fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Serve fresh cache hits; fetch on miss; fall back to stale data on error
    #[default]
    CacheFirst,
    /// Always fetch; fall back to any cached value on error
    NetworkFirst,
    /// Never fetch
    CacheOnly,
    /// Never touch the cache
    NetworkOnly,
    /// Serve any cached value immediately and refresh it in the background
    StaleWhileRevalidate,
}

impl CacheStrategy {
    /// Stable label used in logs and config
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::CacheOnly => "cache-only",
            Self::NetworkOnly => "network-only",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// Bounds and default strategy for one cache type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTypeConfig {
    #[serde(rename = "ttl_ms", with = "duration_millis")]
    pub ttl: Duration,
    #[serde(alias = "max")]
    pub max_entries: usize,
    /// Upper bound on the summed size estimates of all entries
    #[serde(alias = "size")]
    pub max_bytes: usize,
    /// Strategy used by [`Cache::fetch`](super::Cache::fetch)
    pub strategy: CacheStrategy,
}

impl Default for CacheTypeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 1000,
            max_bytes: 10 * 1024 * 1024,
            strategy: CacheStrategy::CacheFirst,
        }
    }
}

impl CacheTypeConfig {
    /// Builder starting from the defaults
    pub fn builder() -> CacheTypeConfigBuilder {
        CacheTypeConfigBuilder::default()
    }

    /// Reject zero TTL and zero bounds
    pub fn validate(&self) -> EngineResult<()> {
        if self.ttl.is_zero() {
            return Err(EngineError::config_field("ttl_ms", "must be greater than zero"));
        }
        if self.max_entries == 0 {
            return Err(EngineError::config_field("max_entries", "must be greater than 0"));
        }
        if self.max_bytes == 0 {
            return Err(EngineError::config_field("max_bytes", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CacheTypeConfig`]
#[derive(Debug, Default)]
pub struct CacheTypeConfigBuilder {
    config: CacheTypeConfig,
}

impl CacheTypeConfigBuilder {
    /// Default time to live
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Entry count bound
    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = max;
        self
    }

    /// Aggregate byte bound
    pub fn max_bytes(mut self, max: usize) -> Self {
        self.config.max_bytes = max;
        self
    }

    /// Default fetch strategy
    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Validate and return the config
    pub fn build(self) -> EngineResult<CacheTypeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
