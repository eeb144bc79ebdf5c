//! HTTP status classification
//!
//! Adapters translate provider responses into [`EngineError`] through these
//! helpers so that every provider shares the same retry semantics.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::EngineError;

/// Map an HTTP status code to an engine error.
///
/// - 401/403 → `Authentication`
/// - 429 → `RateLimited` (carrying `retry_after`)
/// - 408, 5xx → retryable `Platform`
/// - any other status → non-retryable `Platform`
pub fn classify_status(status: u16, retry_after: Option<Duration>, message: &str) -> EngineError {
    match status {
        401 | 403 => EngineError::authentication(format!("HTTP {status}: {message}")),
        429 => EngineError::rate_limited(format!("HTTP 429: {message}"), retry_after),
        408 | 500..=599 => EngineError::platform_retryable(status.to_string(), message),
        _ => EngineError::platform(status.to_string(), message),
    }
}

/// Parse a `Retry-After` header value.
///
/// Accepts both forms allowed by RFC 9110: delay-seconds (`"120"`) and an
/// HTTP-date, which is converted relative to `now`. Dates in the past yield a
/// zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((date - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(feature = "http")]
mod reqwest_support {
    use super::{classify_status, parse_retry_after, EngineError};

    impl From<reqwest::Error> for EngineError {
        fn from(err: reqwest::Error) -> Self {
            if let Some(status) = err.status() {
                return classify_status(status.as_u16(), None, &err.to_string());
            }
            if err.is_timeout() || err.is_connect() || err.is_request() {
                return EngineError::network(err.to_string());
            }
            if err.is_decode() || err.is_body() {
                return EngineError::platform("decode", err.to_string());
            }
            EngineError::network(err.to_string())
        }
    }

    /// Turn a non-success response into a classified error.
    ///
    /// Successful responses are returned untouched. For failures the
    /// `Retry-After` header (if any) and the response body are folded into the
    /// resulting error.
    pub async fn error_for_response(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, chrono::Utc::now()));
        let body = response.text().await.unwrap_or_default();

        Err(classify_status(status.as_u16(), retry_after, &body))
    }
}

#[cfg(feature = "http")]
pub use reqwest_support::error_for_response;

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::error::{ErrorClassification, ErrorKind};

    /// Validates status-to-kind mapping for the common provider responses.
    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401, None, "").kind(), ErrorKind::Authentication);
        assert_eq!(classify_status(403, None, "").kind(), ErrorKind::Authentication);
        assert_eq!(classify_status(429, None, "").kind(), ErrorKind::RateLimited);

        let server = classify_status(503, None, "unavailable");
        assert_eq!(server.kind(), ErrorKind::Platform);
        assert!(server.is_retryable());

        let client = classify_status(404, None, "missing");
        assert_eq!(client.kind(), ErrorKind::Platform);
        assert!(!client.is_retryable());

        assert!(classify_status(408, None, "").is_retryable());
    }

    #[test]
    fn test_classify_status_keeps_retry_after() {
        let err = classify_status(429, Some(Duration::from_secs(3)), "slow down");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 2 ", now), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        let parsed = parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now);
        assert_eq!(parsed, Some(Duration::from_secs(30)));

        let past = parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now);
        assert_eq!(past, Some(Duration::ZERO));
    }
}
