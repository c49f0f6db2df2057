// Job Queue client: hands `JobMessage`s from the Producer to the Worker
// with prefetch=1 semantics (one in-flight job per consumer) and explicit
// ack/nack so a crashed Worker never silently drops a job.

use thiserror::Error;

mod in_memory;
mod redis_queue;

pub use in_memory::InMemoryQueue;
pub use redis_queue::RedisQueue;

use async_trait::async_trait;
use crucible_common::JobMessage;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue operation error: {0}")]
    Operation(String),

    #[error("queue serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl From<QueueError> for crucible_common::CoreError {
    fn from(err: QueueError) -> Self {
        crucible_common::CoreError::QueueUnavailable(err.to_string())
    }
}

/// An in-flight job handed to a consumer. `delivery_id` round-trips back
/// through `ack`/`nack` to identify which in-flight job is being settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: String,
    pub job: JobMessage,
}

/// Client trait for the Job Queue. `consume` delivers exactly one job at a
/// time per caller (prefetch=1): the Worker must `ack` or `nack` before
/// calling `consume` again to receive the next one.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publishes a job for eventual delivery to a Worker.
    async fn publish(&self, job: &JobMessage) -> Result<()>;

    /// Blocks until a job is available, then returns it as an
    /// unacknowledged delivery. Returns `None` only when the queue is
    /// shutting down.
    async fn consume(&self) -> Result<Option<Delivery>>;

    /// Confirms successful processing, permanently removing the job.
    async fn ack(&self, delivery_id: &str) -> Result<()>;

    /// Confirms failed processing. The job is NOT requeued — conformance
    /// with the at-most-once redelivery policy; an operator replays it by
    /// hand via `publish` if needed.
    async fn nack(&self, delivery_id: &str) -> Result<()>;
}
