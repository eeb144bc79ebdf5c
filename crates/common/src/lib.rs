//! Shared building blocks for the relaygate workspace.
//!
//! This crate holds the pieces every engine component depends on but that
//! carry no scheduling logic of their own:
//!
//! - [`error`]: the engine error taxonomy and the [`ErrorClassification`]
//!   contract used by retry predicates
//! - [`time`]: the [`Clock`] abstraction (real and mock) used for delays, TTL
//!   expiry and reservoir refills
//! - [`observability`]: tracing subscriber setup and stable log labels
//! - [`utils`]: serde helpers shared by configuration types
//! - `testing` (feature `test-utils`): scripted operations, timing
//!   assertions and the manually advanced `MockClock`

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod error;
pub mod observability;
pub mod time;
pub mod utils;

#[cfg(any(feature = "test-utils", test))]
pub mod testing;

pub use error::{
    classify_status, parse_retry_after, EngineError, EngineResult, ErrorClassification, ErrorKind,
    ErrorSeverity,
};
#[cfg(feature = "http")]
pub use error::error_for_response;
pub use observability::{init_tracing, LogFormat, TracingConfig};
pub use time::{Clock, SystemClock};
#[cfg(any(feature = "test-utils", test))]
pub use testing::MockClock;
pub use utils::serde::{duration_millis, option_duration_millis};
