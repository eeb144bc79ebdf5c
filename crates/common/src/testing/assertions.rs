//! Custom assertions for testing

// Assertions panic on failure by design of the test harness
#![allow(clippy::missing_panics_doc)]

use std::time::Duration;

/// Assert that a result failed with the given [`ErrorKind`](crate::ErrorKind)
///
/// ```
/// use relaygate_common::{EngineError, ErrorKind};
///
/// let result: Result<(), EngineError> = Err(EngineError::network("reset"));
/// relaygate_common::assert_error_kind!(result, ErrorKind::Network);
/// ```
#[macro_export]
macro_rules! assert_error_kind {
    ($result:expr, $kind:expr) => {
        match &$result {
            Ok(_) => panic!("Expected error of kind {:?} but got Ok", $kind),
            Err(e) => assert_eq!(e.kind(), $kind, "Unexpected error: {}", e),
        }
    };
}

/// Assert that a duration is within a tolerance of an expected value
///
/// ```
/// use std::time::Duration;
///
/// use relaygate_common::testing::assertions::assert_duration_in_range;
///
/// let actual = Duration::from_millis(105);
/// assert_duration_in_range(actual, Duration::from_millis(100), Duration::from_millis(10));
/// ```
pub fn assert_duration_in_range(actual: Duration, expected: Duration, tolerance: Duration) {
    let min = expected.saturating_sub(tolerance);
    let max = expected + tolerance;

    assert!(
        actual >= min && actual <= max,
        "Duration {:?} not in range [{:?}, {:?}]",
        actual,
        min,
        max
    );
}
