//! Integration tests for the retry manager

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relaygate_common::testing::{assert_duration_in_range, poll_until, ScriptedOperation};
use relaygate_common::{EngineError, ErrorKind};
use relaygate_core::{RetryManager, RetryPolicy, RetryPreset};
use tokio::time::Instant;

/// Validates that a server-provided retry-after replaces the computed backoff.
///
/// # Test Steps
/// 1. First attempt fails with `RateLimited(retry_after = 2s)`
/// 2. Second attempt succeeds
/// 3. Verify exactly 2000ms passed between the attempts, no jitter applied
#[tokio::test(start_paused = true)]
async fn test_retry_after_overrides_backoff() {
    let manager = RetryManager::new();
    let script = ScriptedOperation::failing_then(
        1,
        EngineError::rate_limited("slow down", Some(Duration::from_secs(2))),
        "done",
    );

    let start = Instant::now();
    let value = manager
        .execute_with_retry("quota", &RetryPolicy::standard(), || script.invoke())
        .await
        .expect("second attempt succeeds");

    assert_eq!(value, "done");
    assert_eq!(script.calls(), 2);
    assert_duration_in_range(start.elapsed(), Duration::from_secs(2), Duration::from_millis(1));
}

/// Validates the exponential schedule without jitter: 1s, 2s, 4s, 5s.
#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_is_capped() {
    let manager = RetryManager::new();
    let policy = RetryPolicy::builder()
        .max_attempts(5)
        .base_delay(Duration::from_millis(1000))
        .max_delay(Duration::from_millis(5000))
        .backoff_factor(2.0)
        .jitter(false)
        .build()
        .expect("valid policy");
    let script: ScriptedOperation<()> = ScriptedOperation::always_failing(EngineError::network("down"));

    let start = Instant::now();
    let err = manager
        .execute_with_retry("flaky", &policy, || script.invoke())
        .await
        .expect_err("all attempts fail");

    assert_eq!(err.attempts, 5);
    assert_eq!(err.error.kind(), ErrorKind::Network);
    assert_duration_in_range(start.elapsed(), Duration::from_millis(12_000), Duration::from_millis(1));
    assert_eq!(manager.stats().retried, 4);
    assert_eq!(manager.stats().failed, 1);
}

/// Validates that authentication failures are attempted exactly once.
#[tokio::test(start_paused = true)]
async fn test_authentication_short_circuits() {
    let manager = RetryManager::new();
    let script: ScriptedOperation<()> =
        ScriptedOperation::always_failing(EngineError::authentication("expired token"));

    for preset in [RetryPreset::Fast, RetryPreset::Standard, RetryPreset::Robust, RetryPreset::Authentication] {
        let err = manager
            .execute_with_retry(&format!("auth-{preset:?}"), &preset.policy(), || script.invoke())
            .await
            .expect_err("not retryable");
        assert_eq!(err.attempts, 1, "preset {preset:?}");
        assert_eq!(err.error.kind(), ErrorKind::Authentication);
    }
    assert_eq!(script.calls(), 4);
}

/// Validates the on-retry hook sees every retry and a panicking hook does not
/// break the loop.
#[tokio::test(start_paused = true)]
async fn test_on_retry_hooks() {
    let manager = RetryManager::new();
    let seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&seen);
    let policy = RetryPolicy::fast().with_on_retry(move |_, attempt, _| {
        counter.fetch_add(attempt, Ordering::SeqCst);
    });
    let script = ScriptedOperation::failing_then(1, EngineError::network("blip"), 7);

    let value = manager.execute_with_retry("hooked", &policy, || script.invoke()).await.expect("succeeds");
    assert_eq!(value, 7);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let panicking = RetryPolicy::fast().with_on_retry(|_, _, _| panic!("hook failure"));
    let script = ScriptedOperation::failing_then(1, EngineError::network("blip"), 8);
    let value = manager
        .execute_with_retry("panicking-hook", &panicking, || script.invoke())
        .await
        .expect("hook panic is contained");
    assert_eq!(value, 8);
}

/// Validates cancelling an operation during its backoff wait.
///
/// # Test Steps
/// 1. Start an always-failing operation with long backoff in a task
/// 2. Wait until it is tracked as active and past its first attempt
/// 3. Cancel it by id and verify a `Cancelled` error and an empty registry
#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let manager = RetryManager::new();
    let policy = RetryPolicy::builder()
        .max_attempts(10)
        .base_delay(Duration::from_secs(30))
        .max_delay(Duration::from_secs(30))
        .build()
        .expect("valid policy");

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let script: ScriptedOperation<()> = ScriptedOperation::always_failing(EngineError::network("down"));
            manager.execute_with_retry("long-running", &policy, || script.invoke()).await
        })
    };

    let tracked = poll_until(Duration::from_secs(5), Duration::from_millis(10), || {
        let ready = manager.retry_state("long-running").is_some_and(|state| state.last_error.is_some());
        async move { ready }
    })
    .await;
    assert!(tracked, "operation never became active");

    let state = manager.retry_state("long-running").expect("tracked");
    assert_eq!(state.attempt, 1);
    assert_eq!(state.max_attempts, 10);

    assert!(manager.cancel("long-running"));
    let err = task.await.expect("task completes").expect_err("cancelled");
    assert_eq!(err.error.kind(), ErrorKind::Cancelled);
    assert!(manager.active_retries().is_empty());
    assert_eq!(manager.stats().cancelled, 1);
}
