// Durable Store client: the system of record for Executions, queried by
// the dashboard for history and written by the Worker as status changes.

use thiserror::Error;

mod in_memory;
mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use crucible_common::Execution;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("durable store connection error: {0}")]
    Connection(String),

    #[error("durable store query error: {0}")]
    Query(String),

    #[error("execution not found: org={organization_id} task={task_id}")]
    NotFound {
        organization_id: String,
        task_id: String,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for crucible_common::CoreError {
    fn from(err: StoreError) -> Self {
        crucible_common::CoreError::Store(err.to_string())
    }
}

/// Client trait for the Durable Store. Every method is scoped by
/// `organization_id` so a tenant can never read or delete another
/// tenant's execution.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Inserts a new execution or overwrites the existing row for the
    /// same `(organization_id, task_id)`, mirroring the Worker's
    /// durable-before-broadcast write ordering.
    async fn upsert(&self, execution: &Execution) -> Result<()>;

    /// Fetches a single execution, scoped to `organization_id`.
    async fn get_by_task_and_org(
        &self,
        organization_id: &str,
        task_id: &str,
    ) -> Result<Option<Execution>>;

    /// Lists the most recent executions for an organization, newest
    /// `start_time` first, capped at 50 rows.
    async fn list_recent_by_org(&self, organization_id: &str) -> Result<Vec<Execution>>;

    /// Deletes a single execution, scoped to `organization_id`. Returns
    /// `true` if a row was removed.
    async fn delete_by_task_and_org(&self, organization_id: &str, task_id: &str) -> Result<bool>;
}

pub const LIST_RECENT_LIMIT: i64 = 50;
