use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use optimist::cache::{CacheConfig, CacheKey, InvalidationGraph, Mutation, QueryClient};

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    optimist::telemetry::describe_metrics();

    let config = CacheConfig {
        max_entries: 1,
        ..Default::default()
    };
    let client: QueryClient<u32, String> = QueryClient::new(&config, InvalidationGraph::new());

    // Miss, join, then hit on one key
    let slow = || async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, String>(1)
    };
    let key = CacheKey::root("counter");
    let (first, second) = tokio::join!(
        client.read(key.clone(), slow),
        client.read(key.clone(), slow)
    );
    assert_eq!(first, Ok(1));
    assert_eq!(second, Ok(1));
    assert_eq!(client.read(key.clone(), slow).await, Ok(1));

    // Capacity of one evicts the idle key
    client.set(CacheKey::root("other"), 2);
    assert!(client.get(&key).is_none());

    // Failed mutation rolls back its optimistic write
    client.set(key.clone(), 5);
    let mutation = Mutation::new("bump", key.clone(), async {
        Err::<(), _>("offline".to_string())
    })
    .optimistic(0, |n| n + 1);
    assert!(client.run(mutation).await.is_err());
    assert_eq!(client.value(&key), Some(5));

    // Refresh failure after invalidation
    let calls = Arc::new(AtomicUsize::new(0));
    let loads = Arc::clone(&calls);
    let flaky = move || {
        let n = loads.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Ok(7)
            } else {
                Err("server down".to_string())
            }
        }
    };
    let flaky_key = CacheKey::root("flaky");
    assert_eq!(client.read(flaky_key.clone(), flaky).await, Ok(7));
    client.invalidate(&[flaky_key]);
    client.flush_refreshes().await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "optimist_cache_hit_total",
        "optimist_cache_miss_total",
        "optimist_fetch_join_total",
        "optimist_cache_evict_total",
        "optimist_mutation_total",
        "optimist_mutation_ms",
        "optimist_rollback_total",
        "optimist_refresh_failed_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
