use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;

/// Source of monotonic time and delays
///
/// Implementations must be cheap to call; the rate limiter reads the clock on
/// every admission attempt.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Future that resolves once `duration` has elapsed on this clock
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Time elapsed since `earlier`, saturating at zero
    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        (**self).sleep(duration)
    }
}

/// Production clock backed by tokio's time driver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        // tokio's Instant honours paused/advanced time in tests
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for time::clock.
    use super::*;

    /// Validates that the system clock follows tokio's paused time.
    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_paused_time() {
        let clock = SystemClock;
        let start = clock.now();
        clock.sleep(Duration::from_secs(30)).await;
        assert!(clock.since(start) >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_since_saturates() {
        let clock = SystemClock;
        let later = clock.now() + Duration::from_secs(1);
        assert_eq!(clock.since(later), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arc_clock_delegates() {
        let shared: Arc<dyn Clock> = Arc::new(SystemClock);
        let start = shared.now();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(shared.since(start), Duration::from_secs(2));
    }
}
