use async_trait::async_trait;
use crucible_common::JobMessage;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::{Delivery, JobQueue, QueueError, Result};

const QUEUE_KEY: &str = "crucible:jobs:pending";
const PROCESSING_KEY: &str = "crucible:jobs:processing";
const DELIVERY_HASH_KEY: &str = "crucible:jobs:deliveries";
const BLOCKING_POP_TIMEOUT_SECS: f64 = 5.0;

/// Redis-backed implementation using the reliable-queue pattern: `consume`
/// moves a job atomically from the pending list to a processing list via
/// `BRPOPLPUSH`, and records a `delivery_id -> payload` mapping so `ack`/
/// `nack` can remove the exact in-flight copy.
pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Connection(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::Connection(format!("redis connection failed: {e}")))
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn publish(&self, job: &JobMessage) -> Result<()> {
        let payload = serde_json::to_string(job)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;
        conn.rpush::<_, _, ()>(QUEUE_KEY, payload)
            .await
            .map_err(|e| QueueError::Operation(format!("publish failed: {e}")))?;
        Ok(())
    }

    async fn consume(&self) -> Result<Option<Delivery>> {
        let mut conn = self.connection().await?;

        // `BRPOPLPUSH` returns `None` on every blocking-pop timeout, which
        // is ordinary idleness, not queue shutdown — loop past it so `None`
        // is reserved for an actual shutdown signal, matching the trait's
        // contract and the in-memory implementation's behavior.
        let payload = loop {
            let popped: Option<String> = conn
                .brpoplpush(QUEUE_KEY, PROCESSING_KEY, BLOCKING_POP_TIMEOUT_SECS)
                .await
                .map_err(|e| QueueError::Operation(format!("consume failed: {e}")))?;
            if let Some(payload) = popped {
                break payload;
            }
        };

        let job: JobMessage =
            serde_json::from_str(&payload).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let delivery_id = Uuid::new_v4().to_string();
        conn.hset::<_, _, _, ()>(DELIVERY_HASH_KEY, &delivery_id, payload)
            .await
            .map_err(|e| QueueError::Operation(format!("delivery tracking failed: {e}")))?;

        Ok(Some(Delivery { delivery_id, job }))
    }

    async fn ack(&self, delivery_id: &str) -> Result<()> {
        self.settle(delivery_id).await
    }

    async fn nack(&self, delivery_id: &str) -> Result<()> {
        self.settle(delivery_id).await
    }
}

impl RedisQueue {
    async fn settle(&self, delivery_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn
            .hget(DELIVERY_HASH_KEY, delivery_id)
            .await
            .map_err(|e| QueueError::Operation(format!("delivery lookup failed: {e}")))?;

        if let Some(payload) = payload {
            conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, payload)
                .await
                .map_err(|e| QueueError::Operation(format!("processing cleanup failed: {e}")))?;
        }

        conn.hdel::<_, _, ()>(DELIVERY_HASH_KEY, delivery_id)
            .await
            .map_err(|e| QueueError::Operation(format!("delivery cleanup failed: {e}")))?;

        Ok(())
    }
}
