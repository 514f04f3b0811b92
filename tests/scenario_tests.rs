mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use apiflow::optimizer::{OptimizationManager, OptimizedRequest};
use apiflow::testkit::{self, CallCounter};
use futures_util::future::join_all;

#[tokio::test]
async fn twenty_calls_over_five_keys_execute_five_times() {
    let manager = Arc::new(OptimizationManager::new(testkit::config::optimizer()).unwrap());
    let counter = CallCounter::new();
    let started = Instant::now();

    let calls = (0..20).map(|i| {
        let manager = manager.clone();
        let counter = counter.clone();
        let key = format!("repo-{}", i % 5);
        tokio::spawn(async move {
            let request = OptimizedRequest::new("test", "get_repo", key.clone());
            manager
                .execute(request, move |ctx| {
                    support::counted_sleep(ctx, counter, key, Duration::from_millis(50))
                })
                .await
        })
    });
    let responses: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(counter.total(), 5);
    assert_eq!(counter.keys(), 5);
    assert_eq!(responses.len(), 20);
    assert!(started.elapsed() < Duration::from_secs(2));

    for response in &responses {
        assert!(response.data.starts_with("value:repo-"));
    }
    let executors = responses.iter().filter(|r| !r.was_deduplicated).count();
    assert_eq!(executors, 5);

    let stats = manager.stats();
    assert_eq!(stats.total_requests, 20);
    assert_eq!(stats.deduplicated_requests, 15);
    assert!((stats.efficiency_gain - 75.0).abs() < f64::EPSILON);
}
