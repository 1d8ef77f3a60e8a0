use bulkline::{BulkError, Context, RateLimitError, RateLimiterRegistry, TokenBucket};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn twenty_sequential_waits_at_ten_per_second_take_a_second() {
    let bucket = TokenBucket::new(10.0, 10, Duration::from_secs(30));
    let ctx = Context::new();
    let start = Instant::now();
    for _ in 0..20 {
        bucket.wait(&ctx, 1).await.expect("tokens within timeout");
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1200), "took {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn available_tracks_successful_acquires() {
    let bucket = TokenBucket::new(1.0, 8, Duration::from_secs(1));
    for k in 1..=10u32 {
        bucket.try_acquire(1);
        assert_eq!(bucket.available(), 8u32.saturating_sub(k));
    }
}

#[tokio::test(start_paused = true)]
async fn wait_succeeds_after_deficit_over_rate() {
    let bucket = TokenBucket::new(5.0, 5, Duration::from_secs(10));
    assert!(bucket.try_acquire(5));
    let start = Instant::now();
    bucket.wait(&Context::new(), 3).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn endpoints_sharing_a_registry_share_one_budget() {
    let registry = Arc::new(RateLimiterRegistry::new(10.0, 10, Duration::from_secs(30)));
    let start = Instant::now();
    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let ctx = Context::new();
                for _ in 0..10 {
                    registry.wait(&ctx, "accounts/kv", 1).await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(registry.endpoints().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_timeout_surfaces_as_rate_limited_not_deadline() {
    let registry = RateLimiterRegistry::new(0.5, 1, Duration::from_millis(250));
    let ctx = Context::new();
    registry.wait(&ctx, "zones", 1).await.unwrap();
    let err: BulkError<std::io::Error> = registry.wait(&ctx, "zones", 1).await.unwrap_err().into();
    assert!(err.is_rate_limited());
    assert!(!err.is_cancellation());
}

#[tokio::test]
async fn cancellation_unblocks_waiters() {
    let bucket = Arc::new(TokenBucket::new(0.01, 1, Duration::from_secs(3600)));
    assert!(bucket.try_acquire(1));
    let ctx = Context::new();
    let waiter = {
        let bucket = bucket.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { bucket.wait(&ctx, 1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(RateLimitError::Context(_))));
}
