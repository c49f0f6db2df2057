use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crucible_common::Execution;
use tokio::sync::RwLock;

use crate::{DurableStore, Result, LIST_RECENT_LIMIT};

/// In-memory implementation for tests and local development, grounded in
/// the usage tracker's `Arc<RwLock<HashMap<..>>>` storage shape.
#[derive(Default)]
pub struct InMemoryStore {
    rows: Arc<RwLock<HashMap<(String, String), Execution>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn upsert(&self, execution: &Execution) -> Result<()> {
        let key = (
            execution.organization_id.clone(),
            execution.task_id.clone(),
        );
        self.rows.write().await.insert(key, execution.clone());
        Ok(())
    }

    async fn get_by_task_and_org(
        &self,
        organization_id: &str,
        task_id: &str,
    ) -> Result<Option<Execution>> {
        let key = (organization_id.to_string(), task_id.to_string());
        Ok(self.rows.read().await.get(&key).cloned())
    }

    async fn list_recent_by_org(&self, organization_id: &str) -> Result<Vec<Execution>> {
        let rows = self.rows.read().await;
        let mut matches: Vec<Execution> = rows
            .values()
            .filter(|e| e.organization_id == organization_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        matches.truncate(LIST_RECENT_LIMIT as usize);
        Ok(matches)
    }

    async fn delete_by_task_and_org(&self, organization_id: &str, task_id: &str) -> Result<bool> {
        let key = (organization_id.to_string(), task_id.to_string());
        Ok(self.rows.write().await.remove(&key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_common::{ExecutionConfig, ExecutionStatus, RunEnvironment};

    fn sample(org: &str, task: &str) -> Execution {
        Execution::new_pending(
            task.to_string(),
            org.to_string(),
            "alpine:latest".to_string(),
            "npm test".to_string(),
            ExecutionConfig {
                environment: RunEnvironment::Staging,
                base_url: None,
                retry_attempts: 0,
                env_vars: None,
            },
            None,
        )
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = InMemoryStore::new();
        let execution = sample("org-a", "task-1");
        store.upsert(&execution).await.unwrap();

        let fetched = store
            .get_by_task_and_org("org-a", "task-1")
            .await
            .unwrap()
            .expect("row present");
        assert_eq!(fetched.task_id, "task-1");
        assert_eq!(fetched.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn get_is_scoped_to_organization() {
        let store = InMemoryStore::new();
        store.upsert(&sample("org-a", "task-1")).await.unwrap();

        assert!(store
            .get_by_task_and_org("org-b", "task-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_recent_only_returns_matching_org_newest_first() {
        let store = InMemoryStore::new();
        let mut first = sample("org-a", "task-1");
        first.start_time = chrono::Utc::now() - chrono::Duration::seconds(10);
        let second = sample("org-a", "task-2");
        let other_org = sample("org-b", "task-3");

        store.upsert(&first).await.unwrap();
        store.upsert(&second).await.unwrap();
        store.upsert(&other_org).await.unwrap();

        let recent = store.list_recent_by_org("org-a").await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].task_id, "task-2");
        assert_eq!(recent[1].task_id, "task-1");
    }

    #[tokio::test]
    async fn delete_is_scoped_to_organization() {
        let store = InMemoryStore::new();
        store.upsert(&sample("org-a", "task-1")).await.unwrap();

        assert!(!store
            .delete_by_task_and_org("org-b", "task-1")
            .await
            .unwrap());
        assert!(store
            .delete_by_task_and_org("org-a", "task-1")
            .await
            .unwrap());
        assert!(store
            .get_by_task_and_org("org-a", "task-1")
            .await
            .unwrap()
            .is_none());
    }
}
