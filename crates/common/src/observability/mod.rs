//! Logging setup and severity-aware error reporting
//!
//! Library code only emits `tracing` events; binaries and test harnesses call
//! [`init_tracing`] once to install a subscriber. The filter honours
//! `RUST_LOG` and falls back to [`TracingConfig::filter`].

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{EngineError, EngineResult, ErrorClassification, ErrorSeverity};

/// Output format for the fmt layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-field lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Subscriber configuration (the `[logging]` table of the engine config)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Line or JSON output
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self { filter: "relaygate_core=info,relaygate_common=info,warn".to_string(), format: LogFormat::Pretty }
    }
}

/// Install the global tracing subscriber.
///
/// Idempotent: when a global subscriber is already installed (by an earlier
/// call or by the host application) it is kept and `Ok(())` is returned.
/// Fails with a configuration error only when the filter directive is invalid.
pub fn init_tracing(config: &TracingConfig) -> EngineResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| EngineError::config_field("logging.filter", e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().with_target(true)).try_init(),
    };
    if let Err(e) = result {
        if tracing::dispatcher::has_been_set() {
            tracing::debug!("Tracing subscriber already installed; keeping it");
            return Ok(());
        }
        return Err(EngineError::config(format!("Failed to init subscriber: {}", e)));
    }

    tracing::debug!(filter = %config.filter, format = ?config.format, "Tracing initialized");
    Ok(())
}

/// Emit `err` at the level matching its [`ErrorSeverity`].
pub fn log_error(err: &EngineError, context: &str) {
    let kind = err.kind().as_str();
    match err.severity() {
        ErrorSeverity::Info => tracing::info!(error.kind = kind, error = %err, "{}", context),
        ErrorSeverity::Warning => tracing::warn!(error.kind = kind, error = %err, "{}", context),
        ErrorSeverity::Error => tracing::error!(error.kind = kind, error = %err, "{}", context),
        ErrorSeverity::Critical => {
            tracing::error!(error.kind = kind, error = %err, critical = true, "{}", context)
        }
    }
}
