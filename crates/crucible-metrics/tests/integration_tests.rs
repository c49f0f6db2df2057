use crucible_metrics::{InMemoryMetricsCache, MetricsCache};

#[tokio::test]
async fn records_and_retrieves_a_rolling_window() {
    let cache = InMemoryMetricsCache::new();

    for duration in [120u64, 130, 140] {
        cache
            .record_duration("org-acme", "playwright:latest", duration)
            .await
            .unwrap();
    }

    let durations = cache
        .recent_durations("org-acme", "playwright:latest")
        .await
        .unwrap();
    assert_eq!(durations, vec![120, 130, 140]);
}

#[tokio::test]
async fn window_caps_at_ten_most_recent_samples() {
    let cache = InMemoryMetricsCache::new();

    for i in 0..25u64 {
        cache.record_duration("org-acme", "node:20", i * 10).await.unwrap();
    }

    let durations = cache.recent_durations("org-acme", "node:20").await.unwrap();
    assert_eq!(durations.len(), 10);
    assert_eq!(durations.first().copied(), Some(150));
    assert_eq!(durations.last().copied(), Some(240));
}

#[tokio::test]
async fn different_organizations_never_share_a_window() {
    let cache = InMemoryMetricsCache::new();
    cache.record_duration("org-a", "alpine:latest", 1).await.unwrap();
    cache.record_duration("org-b", "alpine:latest", 2).await.unwrap();

    assert_eq!(cache.recent_durations("org-a", "alpine:latest").await.unwrap(), vec![1]);
    assert_eq!(cache.recent_durations("org-b", "alpine:latest").await.unwrap(), vec![2]);
}
