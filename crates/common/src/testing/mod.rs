//! Testing utilities shared by the workspace crates
//!
//! - **[`assertions`]**: duration and error-kind assertions
//! - **[`async_utils`]**: polling helpers that respect paused tokio time
//! - **[`scripted`]**: operations that fail a scripted number of times
//! - **[`time`]**: [`MockClock`], a manually advanced [`Clock`](crate::time::Clock)
//!
//! ```rust
//! use relaygate_common::testing::ScriptedOperation;
//! use relaygate_common::EngineError;
//!
//! let op = ScriptedOperation::new(vec![Err(EngineError::network("reset")), Ok(7)]);
//! assert_eq!(op.remaining(), 2);
//! ```

pub mod assertions;
pub mod async_utils;
pub mod scripted;
pub mod time;

pub use assertions::assert_duration_in_range;
pub use async_utils::poll_until;
pub use scripted::ScriptedOperation;
pub use time::MockClock;
