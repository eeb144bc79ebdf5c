//! Time abstraction for schedulers, retry delays and TTL expiry
//!
//! Every component that needs "now" or needs to wait takes a [`Clock`]
//! instead of calling `Instant::now()` / `tokio::time::sleep` directly:
//!
//! - [`SystemClock`] delegates to tokio's time driver, so tests running with
//!   `#[tokio::test(start_paused = true)]` get deterministic, instant waits.
//! - `MockClock` (feature `test-utils`, in `testing`) is advanced manually
//!   and suits synchronous checks such as cache TTL expiry or reservoir
//!   refill arithmetic.
//!
//! ```
//! use std::time::Duration;
//!
//! use relaygate_common::time::{Clock, SystemClock};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let clock = SystemClock;
//! let start = clock.now();
//! clock.sleep(Duration::from_millis(5)).await;
//! assert!(clock.since(start) >= Duration::from_millis(5));
//! # }
//! ```

mod clock;

pub use clock::{Clock, SystemClock};
