use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_test::{assert_err, assert_ok};
use trafficctl::{
    request_key, Algorithm, CancelSignal, CoordinatorError, ExecutionPolicy, LoadingConfig, ManualClock,
    OperationTracker, RateLimitConfig, RateLimiter, RequestCoordinator, RequestError, Settings, Throttler,
};

#[tokio::test(start_paused = true)]
async fn test_search_as_you_type() {
    let coordinator = RequestCoordinator::<String>::new();
    let limiter = RateLimiter::new();
    let limit = RateLimitConfig::search();
    let policy = ExecutionPolicy::default().with_throttle(Duration::from_millis(300));
    let calls = Arc::new(AtomicUsize::new(0));

    let body = json!({ "q": "shoes" });
    let key = request_key("POST", "/api/search", Some(&body));
    assert_eq!(key, r#"POST:/api/search:{"q":"shoes"}"#);

    let mut results = Vec::new();
    for term in ["s", "sh", "sho", "shoe", "shoes"] {
        assert!(limiter.check_and_consume(&key, &limit).unwrap().allowed);
        let coordinator = coordinator.clone();
        let calls = Arc::clone(&calls);
        let policy = policy.clone();
        let key = key.clone();
        results.push(tokio::spawn(async move {
            coordinator
                .execute(
                    &key,
                    move |_signal| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async move { Ok(format!("results for {}", term)) }
                    },
                    &policy,
                )
                .await
        }));
        sleep(Duration::from_millis(10)).await;
    }

    let results: Vec<String> = join_all(results)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();
    assert_eq!(results[0], "results for s");
    for result in &results[1..] {
        assert_eq!(result, "results for shoes");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    sleep(Duration::from_millis(300)).await;
    let fresh = coordinator
        .execute(&key, |_signal| async { Ok("fresh".to_string()) }, &policy)
        .await;
    assert_eq!(fresh.unwrap(), "fresh");
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success_timing() {
    let coordinator = RequestCoordinator::<u32>::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let policy = ExecutionPolicy::default().with_retries(2, Duration::from_millis(1000));

    let seen = Arc::clone(&attempts);
    let started = Instant::now();
    let result = coordinator
        .execute(
            "orders",
            move |_signal| {
                let attempt = seen.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(RequestError::status(500, "internal"))
                    } else {
                        Ok(3)
                    }
                }
            },
            &policy,
        )
        .await;

    assert_eq!(assert_ok!(result), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3000) && elapsed < Duration::from_millis(3020));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_dedup_with_failure_clears_key() {
    let coordinator = RequestCoordinator::<u32>::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = ExecutionPolicy::default();

    let futures = (0..4).map(|_| {
        let coordinator = coordinator.clone();
        let calls = Arc::clone(&calls);
        let policy = policy.clone();
        async move {
            coordinator
                .execute(
                    "profile",
                    move |_signal| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async {
                            sleep(Duration::from_millis(20)).await;
                            Err::<u32, _>(RequestError::status(403, "forbidden"))
                        }
                    },
                    &policy,
                )
                .await
        }
    });

    for result in join_all(futures).await {
        assert_eq!(
            assert_err!(result),
            CoordinatorError::Request(RequestError::status(403, "forbidden"))
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!coordinator.is_pending("profile"));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiters_all_observe_abort() {
    let coordinator = RequestCoordinator::<u32>::new();
    let policy = ExecutionPolicy::default();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = coordinator.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                coordinator
                    .execute(
                        "download",
                        |signal: CancelSignal| async move {
                            tokio::select! {
                                _ = signal.cancelled() => Err(RequestError::Aborted),
                                _ = sleep(Duration::from_secs(60)) => Ok(1),
                            }
                        },
                        &policy,
                    )
                    .await
            })
        })
        .collect();

    sleep(Duration::from_millis(5)).await;
    assert!(coordinator.cancel("download"));

    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_abort());
    }
    assert_eq!(coordinator.pending_count(), 0);
}

#[test]
fn test_limiters_with_manual_clock() {
    let clock = ManualClock::new();
    let limiter = RateLimiter::with_clock(Arc::new(clock.clone()));

    let sliding = RateLimitConfig::sliding_window(10, Duration::from_millis(1000));
    for _ in 0..10 {
        assert!(limiter.check_and_consume("search", &sliding).unwrap().allowed);
    }
    let denied = limiter.check_and_consume("search", &sliding).unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after.unwrap() > 0);
    clock.advance(Duration::from_millis(1000));
    assert!(limiter.check_and_consume("search", &sliding).unwrap().allowed);

    let fixed = RateLimitConfig::fixed_window(5, Duration::from_secs(60));
    for _ in 0..5 {
        assert!(limiter.check_and_consume("pay", &fixed).unwrap().allowed);
    }
    clock.advance(Duration::from_secs(20));
    let denied = limiter.check_and_consume("pay", &fixed).unwrap();
    assert_eq!(denied.retry_after, Some(40_000));
    clock.advance(Duration::from_secs(40));
    let status = limiter.check_and_consume("pay", &fixed).unwrap();
    assert!(status.allowed);
    assert_eq!(status.remaining, 4);

    let bucket = RateLimitConfig::new(Algorithm::TokenBucket, 3, Duration::from_secs(3));
    for _ in 0..3 {
        assert!(limiter.check_and_consume("api", &bucket).unwrap().allowed);
    }
    assert!(!limiter.check("api", &bucket).unwrap().allowed);
    clock.advance(Duration::from_secs(1));
    assert_eq!(limiter.check("api", &bucket).unwrap().remaining, 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_slot_then_give_up() {
    let limiter = RateLimiter::new();
    let limit = RateLimitConfig::fixed_window(1, Duration::from_millis(500));

    assert!(limiter.wait_for_slot("upload", &limit, Duration::ZERO).await.unwrap());
    assert!(!limiter.wait_for_slot("upload", &limit, Duration::from_millis(100)).await.unwrap());
    assert!(limiter.wait_for_slot("upload", &limit, Duration::from_secs(1)).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_click_protection() {
    let tracker = OperationTracker::new();
    let config = LoadingConfig::new().with_category("checkout");

    assert!(tracker.start_loading("x", &config));
    assert!(!tracker.start_loading("x", &config));
    tracker.stop_loading("x");
    assert!(tracker.start_loading("x", &config));

    let submitted = tracker
        .with_loading(
            "place-order",
            || async {
                sleep(Duration::from_millis(50)).await;
                "ok"
            },
            &config,
        )
        .await;
    assert_eq!(submitted, Some("ok"));
    assert_eq!(tracker.stop_by_category("checkout"), 1);
    assert_eq!(tracker.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_throttler_facade_lifecycle() {
    let settings = Settings {
        sweep_interval: Duration::from_secs(1),
        default_policy: ExecutionPolicy::cached(Duration::from_secs(2)),
        ..Settings::default()
    };
    let throttler = Throttler::<u32>::start(settings).unwrap();

    assert_eq!(throttler.execute("stores", |_signal| async { Ok(11) }).await.unwrap(), 11);
    assert_eq!(throttler.execute("stores", |_signal| async { Ok(12) }).await.unwrap(), 11);

    sleep(Duration::from_millis(3500)).await;
    let stats = throttler.stats().unwrap();
    assert_eq!(stats.coordinator.cache_entries, 0);
    assert_eq!(throttler.execute("stores", |_signal| async { Ok(13) }).await.unwrap(), 13);

    throttler.shutdown().await;
}
