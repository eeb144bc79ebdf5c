//! Error taxonomy for the request execution engine
//!
//! Every failure an adapter, the rate limiter, the retry manager, the cache or
//! the orchestrator can produce is expressed as one [`EngineError`] variant.
//! The variants mirror the failure classes an upstream HTTP API can exhibit:
//!
//! | Variant | Retryable by default | Typical origin |
//! |---------|----------------------|----------------|
//! | `Configuration` | no | invalid scope/policy/cache setup |
//! | `Expired` | no | work item deadline elapsed while queued |
//! | `Cancelled` | no | explicit cancellation or engine shutdown |
//! | `Timeout` | no (caller decides) | overall call deadline exceeded |
//! | `RateLimited` | yes, honouring `retry_after` | HTTP 429 |
//! | `Network` | yes | connect/reset/DNS failures |
//! | `Authentication` | no | HTTP 401/403, revoked tokens |
//! | `Platform` | only if flagged | any other provider failure |
//!
//! ## ErrorClassification
//!
//! Retry predicates never match on error strings. They ask the error through
//! the [`ErrorClassification`] trait:
//!
//! ```
//! use std::time::Duration;
//!
//! use relaygate_common::{EngineError, ErrorClassification};
//!
//! let err = EngineError::rate_limited("quota exhausted", Some(Duration::from_secs(2)));
//! assert!(err.is_retryable());
//! assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
//!
//! let err = EngineError::authentication("token revoked");
//! assert!(!err.is_retryable());
//! ```

mod http;

use std::fmt;
use std::time::Duration;

pub use http::{classify_status, parse_retry_after};
#[cfg(feature = "http")]
pub use http::error_for_response;

/// Standard result type using [`EngineError`]
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure classes recognised by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Invalid setup (scope, policy or cache type); never retried
    Configuration { message: String, field: Option<String> },

    /// A queued work item reached its expiration before admission
    Expired { scope: String, waited: Duration },

    /// The operation was cancelled explicitly or by shutdown
    Cancelled { operation: String, reason: Option<String> },

    /// The overall call deadline elapsed
    Timeout { operation: String, duration: Duration },

    /// The provider signalled quota exhaustion
    RateLimited { message: String, retry_after: Option<Duration> },

    /// Transient transport failure
    Network { message: String },

    /// Credential or permission failure
    Authentication { message: String },

    /// Any other upstream failure, carrying the provider's code
    Platform { code: String, message: String, retryable: bool },
}

/// Discriminant of [`EngineError`], used by retry predicates and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Expired,
    Cancelled,
    Timeout,
    RateLimited,
    Network,
    Authentication,
    Platform,
}

impl ErrorKind {
    /// Stable label suitable for metrics and structured logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Platform => "platform",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { message, field } => {
                if let Some(field) = field {
                    write!(f, "Configuration error in field '{}': {}", field, message)
                } else {
                    write!(f, "Configuration error: {}", message)
                }
            }
            Self::Expired { scope, waited } => {
                write!(f, "Work item for scope '{}' expired after waiting {:?}", scope, waited)
            }
            Self::Cancelled { operation, reason } => {
                if let Some(reason) = reason {
                    write!(f, "Operation '{}' cancelled: {}", operation, reason)
                } else {
                    write!(f, "Operation '{}' cancelled", operation)
                }
            }
            Self::Timeout { operation, duration } => {
                write!(f, "Operation '{}' timed out after {:?}", operation, duration)
            }
            Self::RateLimited { message, retry_after } => {
                if let Some(retry) = retry_after {
                    write!(f, "Rate limit exceeded: {} (retry in {:?})", message, retry)
                } else {
                    write!(f, "Rate limit exceeded: {}", message)
                }
            }
            Self::Network { message } => write!(f, "Network error: {}", message),
            Self::Authentication { message } => write!(f, "Authentication failed: {}", message),
            Self::Platform { code, message, .. } => {
                write!(f, "Platform error [{}]: {}", code, message)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Create a simple configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into(), field: None }
    }

    /// Create a configuration error for a specific field
    pub fn config_field<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Configuration { message: message.into(), field: Some(field.into()) }
    }

    /// Work item deadline passed while queued in `scope`
    pub fn expired<S: Into<String>>(scope: S, waited: Duration) -> Self {
        Self::Expired { scope: scope.into(), waited }
    }

    /// Operation cancelled by its caller or by shutdown
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled { operation: operation.into(), reason: None }
    }

    /// Cancellation with an explanatory reason
    pub fn cancelled_with_reason<S: Into<String>, R: Into<String>>(operation: S, reason: R) -> Self {
        Self::Cancelled { operation: operation.into(), reason: Some(reason.into()) }
    }

    /// Overall deadline of `duration` elapsed
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Provider throttled the call; `retry_after` overrides backoff
    pub fn rate_limited<S: Into<String>>(message: S, retry_after: Option<Duration>) -> Self {
        Self::RateLimited { message: message.into(), retry_after }
    }

    /// Transport failure (connect, reset, DNS)
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network { message: message.into() }
    }

    /// Credentials rejected or expired
    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::Authentication { message: message.into() }
    }

    /// Create a platform error that retry policies will not re-attempt
    pub fn platform<C: Into<String>, S: Into<String>>(code: C, message: S) -> Self {
        Self::Platform { code: code.into(), message: message.into(), retryable: false }
    }

    /// Create a platform error classified as transient
    pub fn platform_retryable<C: Into<String>, S: Into<String>>(code: C, message: S) -> Self {
        Self::Platform { code: code.into(), message: message.into(), retryable: true }
    }

    /// Discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Network { .. } => ErrorKind::Network,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Platform { .. } => ErrorKind::Platform,
        }
    }

    /// Key/value pairs for structured logging
    pub fn as_tracing_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("error.kind", self.kind().as_str().to_string())];
        match self {
            Self::Configuration { field: Some(field), .. } => fields.push(("error.field", field.clone())),
            Self::Expired { scope, waited } => {
                fields.push(("error.scope", scope.clone()));
                fields.push(("error.waited_ms", waited.as_millis().to_string()));
            }
            Self::Timeout { duration, .. } => {
                fields.push(("error.timeout_ms", duration.as_millis().to_string()));
            }
            Self::RateLimited { retry_after: Some(retry), .. } => {
                fields.push(("error.retry_after_ms", retry.as_millis().to_string()));
            }
            Self::Platform { code, .. } => fields.push(("error.code", code.clone())),
            _ => {}
        }
        fields
    }
}

/// Error classification trait for consistent retry and alerting decisions
///
/// Retry predicates, log levels and metrics labels are all derived from this
/// contract rather than from error messages.
pub trait ErrorClassification {
    /// Whether re-attempting the same operation may succeed
    fn is_retryable(&self) -> bool;

    /// Severity used for log levels and alerting
    fn severity(&self) -> ErrorSeverity;

    /// Whether the failure needs operator attention (e.g. revoked credentials)
    fn is_critical(&self) -> bool;

    /// Server-specified delay before the next attempt, if any
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl ErrorClassification for EngineError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network { .. } => true,
            Self::Platform { retryable, .. } => *retryable,
            // Timeouts are retried only by policies that opt in.
            Self::Timeout { .. } => false,
            Self::Configuration { .. }
            | Self::Expired { .. }
            | Self::Cancelled { .. }
            | Self::Authentication { .. } => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Configuration { .. } => ErrorSeverity::Error,
            Self::Expired { .. } => ErrorSeverity::Warning,
            Self::Cancelled { .. } => ErrorSeverity::Info,
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::RateLimited { .. } => ErrorSeverity::Warning,
            Self::Network { .. } => ErrorSeverity::Error,
            Self::Authentication { .. } => ErrorSeverity::Critical,
            Self::Platform { .. } => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::platform("serialization", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for error classification and formatting.
    use super::*;

    /// Validates the default retryability of every error kind.
    #[test]
    fn test_retryability_by_kind() {
        assert!(EngineError::network("reset").is_retryable());
        assert!(EngineError::rate_limited("slow down", None).is_retryable());
        assert!(EngineError::platform_retryable("503", "unavailable").is_retryable());

        assert!(!EngineError::platform("404", "missing").is_retryable());
        assert!(!EngineError::authentication("expired token").is_retryable());
        assert!(!EngineError::config("bad").is_retryable());
        assert!(!EngineError::expired("spotify", Duration::from_secs(1)).is_retryable());
        assert!(!EngineError::cancelled("op-1").is_retryable());
        assert!(!EngineError::timeout("op-1", Duration::from_secs(5)).is_retryable());
    }

    /// Validates that only rate limit errors expose a retry-after hint.
    #[test]
    fn test_retry_after_only_for_rate_limits() {
        let err = EngineError::rate_limited("429", Some(Duration::from_millis(2000)));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(2000)));
        assert_eq!(EngineError::network("reset").retry_after(), None);
    }

    #[test]
    fn test_authentication_is_critical() {
        let err = EngineError::authentication("revoked");
        assert!(err.is_critical());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(!EngineError::network("reset").is_critical());
    }

    /// Validates Display output for variants with optional fields.
    #[test]
    fn test_display_formats() {
        let err = EngineError::config_field("capacity", "must be greater than 0");
        assert_eq!(err.to_string(), "Configuration error in field 'capacity': must be greater than 0");

        let err = EngineError::cancelled_with_reason("op-7", "engine shutdown");
        assert!(err.to_string().contains("engine shutdown"));

        let err = EngineError::platform("E42", "boom");
        assert_eq!(err.to_string(), "Platform error [E42]: boom");
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(EngineError::network("x").kind(), ErrorKind::Network);
        assert_eq!(ErrorKind::RateLimited.as_str(), "rate_limited");
        assert_eq!(ErrorKind::Authentication.to_string(), "authentication");
    }

    #[test]
    fn test_tracing_fields_include_kind_and_details() {
        let err = EngineError::rate_limited("429", Some(Duration::from_millis(1500)));
        let fields = err.as_tracing_fields();
        assert!(fields.contains(&("error.kind", "rate_limited".to_string())));
        assert!(fields.contains(&("error.retry_after_ms", "1500".to_string())));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARN");
    }
}
