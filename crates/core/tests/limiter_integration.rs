//! Integration tests for the hierarchical rate limiter
//!
//! Timing runs on tokio's paused clock, so schedules are exact and the tests
//! finish instantly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relaygate_common::testing::assert_duration_in_range;
use relaygate_core::{RateLimiter, RateLimiterConfig, Scope, ScopeConfig, WorkItem};
use tokio::time::Instant;

/// Validates the combined effect of spacing, concurrency and reservoir limits.
///
/// # Test Steps
/// 1. Configure a scope with `min_time = 100ms`, `max_concurrent = 2` and a
///    reservoir of 3 refreshed by 3 every 1000ms
/// 2. Submit 6 items at t=0, each running for 300ms
/// 3. Verify at most 2 ran concurrently, admissions were at least 100ms apart
///    and items 4-6 started no earlier than t=1000ms
#[tokio::test(start_paused = true)]
async fn test_spacing_concurrency_and_reservoir_combined() {
    let limiter = RateLimiter::new(RateLimiterConfig::default()).expect("limiter");
    let scope = Scope::new("spotify");
    let config = ScopeConfig::builder()
        .min_spacing(Duration::from_millis(100))
        .max_concurrent(2)
        .reservoir(3, Duration::from_millis(1000))
        .build()
        .expect("valid scope config");
    limiter.configure(scope.clone(), config).expect("configure scope");

    let start = Instant::now();
    let admissions = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let limiter = limiter.clone();
        let scope = scope.clone();
        let admissions = Arc::clone(&admissions);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            limiter
                .schedule(&scope, WorkItem::default(), || async move {
                    admissions.lock().push(start.elapsed());
                    let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_running, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("task completes").expect("item admitted");
    }

    let mut admissions = admissions.lock().clone();
    admissions.sort();
    assert_eq!(admissions.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2, "concurrency cap exceeded");
    for pair in admissions.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(100), "admissions too close: {pair:?}");
    }
    for late in &admissions[3..] {
        assert!(*late >= Duration::from_millis(1000), "item admitted before refill: {late:?}");
    }
}

/// Validates that an exhausted reservoir admits nothing until a full refill
/// interval has passed.
#[tokio::test(start_paused = true)]
async fn test_refill_boundary() {
    let limiter = RateLimiter::new(RateLimiterConfig::default()).expect("limiter");
    let scope = Scope::new("youtube");
    let config = ScopeConfig::builder()
        .max_concurrent(10)
        .reservoir(5, Duration::from_secs(60))
        .build()
        .expect("valid scope config");
    limiter.configure(scope.clone(), config).expect("configure scope");

    for _ in 0..5 {
        limiter.schedule(&scope, WorkItem::default(), || async { Ok(()) }).await.expect("admitted");
    }
    assert_eq!(limiter.reservoir_level(&scope), Some(0));

    let start = Instant::now();
    limiter.schedule(&scope, WorkItem::default(), || async { Ok(()) }).await.expect("admitted after refill");
    assert_duration_in_range(start.elapsed(), Duration::from_secs(60), Duration::from_millis(5));
    assert_eq!(limiter.reservoir_level(&scope), Some(4));
}

/// Validates that the global reservoir caps the sum of all scopes.
#[tokio::test(start_paused = true)]
async fn test_global_quota_spans_scopes() {
    let global = ScopeConfig::builder()
        .max_concurrent(10)
        .reservoir(3, Duration::from_secs(10))
        .build()
        .expect("valid global config");
    let limiter = RateLimiter::new(RateLimiterConfig { global, default_scope: Some(ScopeConfig::default()) })
        .expect("limiter");

    let start = Instant::now();
    for name in ["a", "b", "c", "d"] {
        limiter
            .schedule(&Scope::new(name), WorkItem::default(), || async { Ok(()) })
            .await
            .expect("admitted");
    }

    assert_duration_in_range(start.elapsed(), Duration::from_secs(10), Duration::from_millis(5));
    assert_eq!(limiter.scopes().len(), 4);
}

/// Validates that a heavy item consumes its full weight from the reservoir.
#[tokio::test(start_paused = true)]
async fn test_weighted_item_consumes_weight() {
    let limiter = RateLimiter::new(RateLimiterConfig::default()).expect("limiter");
    let scope = Scope::new("soundcloud");
    let config = ScopeConfig::builder().reservoir(10, Duration::from_secs(1)).build().expect("valid");
    limiter.configure(scope.clone(), config).expect("configure scope");

    limiter
        .schedule(&scope, WorkItem::default().with_weight(7), || async { Ok(()) })
        .await
        .expect("admitted");
    assert_eq!(limiter.reservoir_level(&scope), Some(3));

    let start = Instant::now();
    limiter
        .schedule(&scope, WorkItem::default().with_weight(5), || async { Ok(()) })
        .await
        .expect("admitted after refill");
    assert_duration_in_range(start.elapsed(), Duration::from_secs(1), Duration::from_millis(5));
}

/// Validates that an operation error passes through and frees the slot.
#[tokio::test(start_paused = true)]
async fn test_operation_error_releases_slot() {
    let limiter = RateLimiter::new(RateLimiterConfig::default()).expect("limiter");
    let scope = Scope::new("api");
    let config = ScopeConfig::builder().max_concurrent(1).build().expect("valid");
    limiter.configure(scope.clone(), config).expect("configure scope");

    let err = limiter
        .schedule(&scope, WorkItem::default(), || async {
            Err::<(), _>(relaygate_common::EngineError::network("reset"))
        })
        .await
        .expect_err("error passes through");
    assert_eq!(err, relaygate_common::EngineError::network("reset"));
    assert_eq!(limiter.running(&scope), 0);
}
