use bulkline::{ConcurrencyManager, Context, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn single_rate_limit_failure_halves_target() {
    let manager = ConcurrencyManager::new(2, 20);
    manager.set_target(10);
    manager.record_failure(true);
    assert_eq!(manager.optimal_concurrency(), 5);
}

#[tokio::test(start_paused = true)]
async fn target_stays_within_bounds_under_any_signal_mix() {
    let manager = ConcurrencyManager::new(3, 12);
    for round in 0..20u64 {
        tokio::time::advance(Duration::from_secs(11)).await;
        for i in 0..120u64 {
            match (round + i) % 7 {
                0 => manager.record_failure(round % 3 == 0),
                1 => manager.record_success(Duration::from_secs(3)),
                _ => manager.record_success(Duration::from_millis(20)),
            }
            let target = manager.optimal_concurrency();
            assert!((3..=12).contains(&target), "target {target} out of bounds");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limited_pool_sheds_workers() {
    let manager = Arc::new(ConcurrencyManager::new(2, 8));
    manager.set_target(8);
    let op = |_ctx: Context, n: u32| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if n % 10 == 0 {
            Err(format!("HTTP 429 Too Many Requests (item {n})"))
        } else {
            Ok(n)
        }
    };
    let (pool, mut outputs) = WorkerPool::builder(op, manager.clone()).build();
    assert_eq!(pool.active_workers(), 8);

    let pool = Arc::new(pool);
    let producer = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for n in 0..50 {
                pool.submit(n).await.unwrap();
            }
            pool.shutdown().await;
        })
    };

    let mut results = 0;
    let mut errors = 0;
    loop {
        tokio::select! {
            Some(_) = outputs.results.recv() => results += 1,
            Some(_) = outputs.errors.recv() => errors += 1,
            else => break,
        }
    }
    producer.await.unwrap();

    assert_eq!((results, errors), (45, 5));
    assert_eq!(manager.optimal_concurrency(), 2);
    assert_eq!(manager.snapshot().rate_limit_hits, 5);
    assert_eq!(pool.active_workers(), 0);
}
