//! Serialization utilities for configuration types
//!
//! Durations in configuration files and snapshots are expressed as integer
//! milliseconds (`timeout_ms = 30000`).

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde serialization result type
type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

/// Custom serialization module for Duration as milliseconds
///
/// # Usage
/// ```rust
/// use std::time::Duration;
///
/// use relaygate_common::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::*;

    /// Serialize a Duration as milliseconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize milliseconds (u64) into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional Duration as milliseconds; pair with `#[serde(default)]`
pub mod option_duration_millis {
    use super::*;

    /// `Some` as milliseconds, `None` as none
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    /// Missing or null values become `None`
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for serialization utilities
    //!
    //! Tests cover duration_millis and option_duration_millis conversion and
    //! invalid input handling.

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        #[serde(with = "duration_millis")]
        timeout: Duration,
        #[serde(default, with = "option_duration_millis")]
        spacing: Option<Duration>,
        name: String,
    }

    /// Tests that Duration serializes to milliseconds as u64
    #[test]
    fn test_duration_millis_serialize() {
        let data = TestStruct {
            timeout: Duration::from_millis(1500),
            spacing: None,
            name: "test".to_string(),
        };

        let json = serde_json::to_string(&data).expect("Should serialize valid struct");
        assert!(json.contains("\"timeout\":1500"), "Should contain milliseconds value");
        assert!(json.contains("\"spacing\":null"), "Missing spacing should serialize as null");
    }

    /// Tests that milliseconds deserialize to Duration and a missing optional
    /// field falls back to None
    #[test]
    fn test_duration_millis_deserialize() {
        let json = r#"{"timeout":2500,"name":"test"}"#;
        let data: TestStruct = serde_json::from_str(json).expect("Should deserialize valid JSON");

        assert_eq!(data.timeout, Duration::from_millis(2500));
        assert_eq!(data.spacing, None);
    }

    #[test]
    fn test_option_duration_millis_present() {
        let json = r#"{"timeout":0,"spacing":200,"name":"spaced"}"#;
        let data: TestStruct = serde_json::from_str(json).expect("Should deserialize valid JSON");

        assert_eq!(data.timeout, Duration::ZERO);
        assert_eq!(data.spacing, Some(Duration::from_millis(200)));
    }

    /// Validates the duration millis deserialize invalid json scenario.
    #[test]
    fn test_duration_millis_deserialize_invalid_json() {
        let invalid_json = r#"{"timeout":"not_a_number","name":"test"}"#;
        let result: Result<TestStruct, _> = serde_json::from_str(invalid_json);
        assert!(result.is_err());
    }
}
