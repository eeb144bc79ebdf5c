//! Async test utilities

use std::future::Future;
use std::time::Duration;

/// Poll `condition` every `interval` until it holds or `timeout` elapses.
///
/// Uses tokio's clock, so it behaves deterministically under
/// `#[tokio::test(start_paused = true)]`.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }

    false
}

#[cfg(test)]
mod tests {
    //! Unit tests for testing::async_utils.
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_eventually_true() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = poll_until(Duration::from_secs(1), Duration::from_millis(10), move || {
            let calls = Arc::clone(&calls_clone);
            async move { calls.fetch_add(1, Ordering::SeqCst) >= 3 }
        })
        .await;

        assert!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let result = poll_until(Duration::from_millis(50), Duration::from_millis(10), || async { false }).await;
        assert!(!result);
    }
}
