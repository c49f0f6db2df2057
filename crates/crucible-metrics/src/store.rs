use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use crucible_common::{metrics_key, METRICS_WINDOW_SIZE};
use tokio::sync::RwLock;

use crate::{MetricsError, Result};

/// Client trait for the Metrics Cache: a bounded, per-(org, image) window
/// of recent execution durations.
#[async_trait]
pub trait MetricsCache: Send + Sync {
    /// Appends `duration_ms` to the window for `(organization_id, image)`,
    /// trimming to the last `METRICS_WINDOW_SIZE` entries.
    async fn record_duration(
        &self,
        organization_id: &str,
        image: &str,
        duration_ms: u64,
    ) -> Result<()>;

    /// Returns the window's contents, most recent last. Empty if the key
    /// has never been written.
    async fn recent_durations(&self, organization_id: &str, image: &str) -> Result<Vec<u64>>;
}

/// In-memory implementation for tests and local development, grounded in
/// the usage tracker's `RwLock<HashMap<..>>` storage shape.
#[derive(Default)]
pub struct InMemoryMetricsCache {
    windows: Arc<RwLock<HashMap<String, VecDeque<u64>>>>,
}

impl InMemoryMetricsCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsCache for InMemoryMetricsCache {
    async fn record_duration(
        &self,
        organization_id: &str,
        image: &str,
        duration_ms: u64,
    ) -> Result<()> {
        let key = metrics_key(organization_id, image);
        let mut windows = self.windows.write().await;
        let window = windows.entry(key).or_default();
        window.push_back(duration_ms);
        while window.len() > METRICS_WINDOW_SIZE {
            window.pop_front();
        }
        Ok(())
    }

    async fn recent_durations(&self, organization_id: &str, image: &str) -> Result<Vec<u64>> {
        let key = metrics_key(organization_id, image);
        let windows = self.windows.read().await;
        Ok(windows
            .get(&key)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default())
    }
}

/// Redis-backed implementation using a capped list per key: `LPUSH` the
/// newest sample then `LTRIM` to the window size, atomic per connection
/// round trip semantics from redis's pipeline support.
pub struct RedisMetricsCache {
    client: redis::Client,
}

impl RedisMetricsCache {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| MetricsError::Cache(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| MetricsError::Cache(format!("redis connection failed: {e}")))
    }
}

#[async_trait]
impl MetricsCache for RedisMetricsCache {
    async fn record_duration(
        &self,
        organization_id: &str,
        image: &str,
        duration_ms: u64,
    ) -> Result<()> {
        let key = metrics_key(organization_id, image);
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .lpush(&key, duration_ms)
            .ltrim(&key, 0, METRICS_WINDOW_SIZE as isize - 1)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| MetricsError::Cache(format!("record_duration failed: {e}")))?;
        Ok(())
    }

    async fn recent_durations(&self, organization_id: &str, image: &str) -> Result<Vec<u64>> {
        let key = metrics_key(organization_id, image);
        let mut conn = self.connection().await?;
        let mut values: Vec<u64> = redis::cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(METRICS_WINDOW_SIZE as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| MetricsError::Cache(format!("recent_durations failed: {e}")))?;
        // LPUSH prepends, so the list is newest-first; reverse to
        // match the in-memory impl's oldest-first ordering.
        values.reverse();
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_trims_to_fixed_size() {
        let cache = InMemoryMetricsCache::new();
        for i in 0..15u64 {
            cache.record_duration("org-a", "alpine:latest", i).await.unwrap();
        }
        let durations = cache.recent_durations("org-a", "alpine:latest").await.unwrap();
        assert_eq!(durations.len(), METRICS_WINDOW_SIZE);
        assert_eq!(durations, vec![5, 6, 7, 8, 9, 10, 11, 12, 13, 14]);
    }

    #[tokio::test]
    async fn windows_are_isolated_per_org_and_image() {
        let cache = InMemoryMetricsCache::new();
        cache.record_duration("org-a", "alpine:latest", 100).await.unwrap();
        cache.record_duration("org-b", "alpine:latest", 200).await.unwrap();
        cache.record_duration("org-a", "node:20", 300).await.unwrap();

        assert_eq!(cache.recent_durations("org-a", "alpine:latest").await.unwrap(), vec![100]);
        assert_eq!(cache.recent_durations("org-b", "alpine:latest").await.unwrap(), vec![200]);
        assert_eq!(cache.recent_durations("org-a", "node:20").await.unwrap(), vec![300]);
    }

    #[tokio::test]
    async fn unknown_key_returns_empty() {
        let cache = InMemoryMetricsCache::new();
        assert!(cache.recent_durations("org-z", "nope").await.unwrap().is_empty());
    }
}
