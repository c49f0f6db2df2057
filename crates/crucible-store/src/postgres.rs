use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crucible_common::{Execution, ExecutionConfig, ExecutionStatus, SCHEMA_VERSION};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::{DurableStore, Result, StoreError, LIST_RECENT_LIMIT};

/// Postgres-backed implementation of the Durable Store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects and applies the migration set, bringing the schema up to
    /// [`SCHEMA_VERSION`].
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                task_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                status TEXT NOT NULL,
                image TEXT NOT NULL,
                command TEXT NOT NULL,
                config JSONB NOT NULL,
                tests JSONB,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ,
                output TEXT NOT NULL DEFAULT '',
                error TEXT,
                analysis TEXT,
                reports_base_url TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (organization_id, task_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_org_start_time ON executions (organization_id, start_time DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(SCHEMA_VERSION as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    task_id: String,
    organization_id: String,
    status: String,
    image: String,
    command: String,
    config: serde_json::Value,
    tests: Option<serde_json::Value>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    output: String,
    error: Option<String>,
    analysis: Option<String>,
    reports_base_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> std::result::Result<Self, Self::Error> {
        let status = status_from_str(&row.status)?;
        let config: ExecutionConfig = serde_json::from_value(row.config)
            .map_err(|e| StoreError::Query(format!("invalid config json: {e}")))?;
        let tests = row
            .tests
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Query(format!("invalid tests json: {e}")))?;
        Ok(Execution {
            task_id: row.task_id,
            organization_id: row.organization_id,
            status,
            image: row.image,
            command: row.command,
            config,
            tests,
            start_time: row.start_time,
            end_time: row.end_time,
            output: row.output,
            error: row.error,
            analysis: row.analysis,
            reports_base_url: row.reports_base_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_from_str(status: &str) -> Result<ExecutionStatus> {
    Ok(match status {
        "PENDING" => ExecutionStatus::Pending,
        "RUNNING" => ExecutionStatus::Running,
        "ANALYZING" => ExecutionStatus::Analyzing,
        "PASSED" => ExecutionStatus::Passed,
        "FAILED" => ExecutionStatus::Failed,
        "UNSTABLE" => ExecutionStatus::Unstable,
        "ERROR" => ExecutionStatus::Error,
        other => return Err(StoreError::Query(format!("unknown status in row: {other}"))),
    })
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn upsert(&self, execution: &Execution) -> Result<()> {
        let config = serde_json::to_value(&execution.config)
            .map_err(|e| StoreError::Query(format!("failed to serialize config: {e}")))?;
        let tests = execution
            .tests
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Query(format!("failed to serialize tests: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO executions (
                task_id, organization_id, status, image, command, config, tests,
                start_time, end_time, output, error, analysis, reports_base_url,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (organization_id, task_id) DO UPDATE SET
                status = EXCLUDED.status,
                image = EXCLUDED.image,
                command = EXCLUDED.command,
                config = EXCLUDED.config,
                tests = EXCLUDED.tests,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                output = EXCLUDED.output,
                error = EXCLUDED.error,
                analysis = EXCLUDED.analysis,
                reports_base_url = EXCLUDED.reports_base_url,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&execution.task_id)
        .bind(&execution.organization_id)
        .bind(execution.status.to_string())
        .bind(&execution.image)
        .bind(&execution.command)
        .bind(config)
        .bind(tests)
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(&execution.analysis)
        .bind(&execution.reports_base_url)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_by_task_and_org(
        &self,
        organization_id: &str,
        task_id: &str,
    ) -> Result<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE organization_id = $1 AND task_id = $2",
        )
        .bind(organization_id)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        row.map(Execution::try_from).transpose()
    }

    async fn list_recent_by_org(&self, organization_id: &str) -> Result<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE organization_id = $1 ORDER BY start_time DESC LIMIT $2",
        )
        .bind(organization_id)
        .bind(LIST_RECENT_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.into_iter().map(Execution::try_from).collect()
    }

    async fn delete_by_task_and_org(&self, organization_id: &str, task_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM executions WHERE organization_id = $1 AND task_id = $2")
            .bind(organization_id)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
