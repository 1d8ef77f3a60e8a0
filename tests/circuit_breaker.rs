use bulkline::{
    BulkError, CircuitBreaker, CircuitState, Context, InstantSleeper, ManualClock, RetryManager,
    RetryPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
struct ApiError(&'static str);

async fn call(
    breaker: &CircuitBreaker,
    calls: &AtomicUsize,
    succeed: bool,
) -> Result<(), BulkError<ApiError>> {
    breaker
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            if succeed {
                Ok(())
            } else {
                Err(BulkError::Inner(ApiError("HTTP 502 Bad Gateway")))
            }
        })
        .await
}

#[tokio::test]
async fn open_breaker_never_invokes_until_one_probe_after_timeout() {
    for max_failures in 1..=5 {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new("purge", max_failures, Duration::from_secs(30))
            .unwrap()
            .with_clock(clock.clone());
        let calls = AtomicUsize::new(0);

        for _ in 0..max_failures {
            assert!(matches!(call(&breaker, &calls, false).await, Err(BulkError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), max_failures);

        for _ in 0..10 {
            assert!(call(&breaker, &calls, true).await.unwrap_err().is_circuit_open());
        }
        assert_eq!(calls.load(Ordering::SeqCst), max_failures, "open breaker invoked the operation");

        clock.advance(30_001);
        call(&breaker, &calls, true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), max_failures + 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
    }
}

#[tokio::test]
async fn retry_manager_stops_retrying_once_breaker_opens() {
    let policy = RetryPolicy::builder()
        .max_attempts(10)
        .jitter(0.0)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let manager = RetryManager::new(policy);
    let clock = ManualClock::new();
    manager.insert_breaker(
        CircuitBreaker::new("kv-delete", 3, Duration::from_secs(30)).unwrap().with_clock(clock.clone()),
    );

    let calls = AtomicUsize::new(0);
    let result: Result<(), _> = manager
        .execute_with_retry(&Context::new(), "kv-delete", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError("connection reset by peer")) }
        })
        .await;
    let err = result.unwrap_err();
    assert!(err.is_circuit_open(), "{err}");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    clock.advance(31_000);
    let ok = manager
        .execute_with_retry(&Context::new(), "kv-delete", || async { Ok::<_, ApiError>("deleted") })
        .await;
    assert_eq!(ok.unwrap(), "deleted");
    assert_eq!(manager.states(), vec![("kv-delete".to_string(), CircuitState::Closed)]);
}

#[tokio::test]
async fn cancelled_retry_loop_leaves_breaker_closed() {
    let policy = RetryPolicy::builder().max_attempts(3).build().unwrap();
    let manager = RetryManager::new(policy);
    let ctx = Context::new();
    ctx.cancel();
    let result: Result<(), BulkError<ApiError>> = manager
        .execute_with_retry(&ctx, "purge", || async { Err(ApiError("HTTP 500")) })
        .await;
    assert!(matches!(result, Err(BulkError::Cancelled)));
    assert_eq!(manager.breaker("purge").failures(), 0);
}
