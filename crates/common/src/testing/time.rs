//! Manually advanced clock for deterministic tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::time::Clock;

/// Clock that only moves when told to
///
/// Suited to synchronous arithmetic checks such as cache TTL expiry or
/// reservoir refill. `sleep` does not wait: on its first poll it moves the
/// shared time forward by the full duration and yields once. A sleep that
/// loses a `select!` has still advanced the clock, so components racing a
/// deadline against other work (limiter expiration waits, the engine timeout)
/// should be tested with [`SystemClock`](crate::time::SystemClock) under
/// paused tokio time instead.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Clock starting at the current instant
    pub fn new() -> Self {
        Self { start: Instant::now(), elapsed: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Advance the clock by `duration`, saturating at the largest offset
    pub fn advance(&self, duration: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = elapsed.saturating_add(duration);
    }

    /// Advance by `millis` milliseconds
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Set the clock to an absolute offset from its creation instant
    pub fn set_elapsed(&self, duration: Duration) {
        *self.elapsed.lock() = duration;
    }

    /// Total simulated time since creation
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let elapsed = *self.elapsed.lock();
        // Offsets past what Instant can hold pin to the last representable step
        self.start.checked_add(elapsed).unwrap_or_else(|| {
            let mut step = elapsed;
            loop {
                step /= 2;
                if let Some(later) = self.start.checked_add(step) {
                    break later;
                }
            }
        })
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let clock = self.clone();
        async move {
            clock.advance(duration);
            tokio::task::yield_now().await;
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for testing::time.
    use super::*;

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(5));
        clock.advance_millis(250);

        assert_eq!(clock.now().duration_since(start), Duration::from_millis(5250));
        assert_eq!(clock.elapsed(), Duration::from_millis(5250));
    }

    #[test]
    fn test_mock_clock_set_elapsed() {
        let clock = MockClock::new();
        clock.advance(Duration::from_secs(10));
        clock.set_elapsed(Duration::from_secs(3));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    /// Validates that clones share the same timeline.
    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::new();
        let other = clock.clone();
        other.advance(Duration::from_secs(1));
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    /// Validates that advancing past the representable range neither panics
    /// nor moves time backwards.
    #[test]
    fn test_mock_clock_saturates() {
        let clock = MockClock::new();
        let before = clock.now();
        clock.advance(Duration::MAX);
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.elapsed(), Duration::MAX);
        assert!(clock.now() > before);
    }

    #[tokio::test]
    async fn test_mock_clock_sleep_advances() {
        let clock = MockClock::new();
        clock.sleep(Duration::from_millis(400)).await;
        assert_eq!(clock.elapsed(), Duration::from_millis(400));
    }

    #[test]
    fn test_arc_mock_clock_delegates() {
        let mock = Arc::new(MockClock::new());
        let shared: Arc<dyn Clock> = mock.clone();
        let start = shared.now();
        mock.advance(Duration::from_secs(2));
        assert_eq!(shared.since(start), Duration::from_secs(2));
    }
}
