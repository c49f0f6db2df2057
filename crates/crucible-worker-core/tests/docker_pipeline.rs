use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use crucible_analyzer::AiAnalyzer;
use crucible_api_types::{ExecutionLogBody, ExecutionUpdateBody};
use crucible_common::{ExecutionConfig, ExecutionStatus, JobMessage, RunEnvironment};
use crucible_executor::DockerEngine;
use crucible_metrics::InMemoryMetricsCache;
use crucible_store::{DurableStore, InMemoryStore};
use crucible_worker_core::{JobPipeline, JobPipelineConfig, PipelineOutcome, ProducerNotifier};
use docktopus::bollard::Docker;

struct NullNotifier;

#[async_trait]
impl ProducerNotifier for NullNotifier {
    async fn notify_update(&self, _body: ExecutionUpdateBody) {}
    async fn notify_log(&self, _body: ExecutionLogBody) {}
}

struct UnreachableAnalyzer;

#[async_trait]
impl AiAnalyzer for UnreachableAnalyzer {
    async fn analyze(
        &self,
        _log_tail: &str,
        _image: &str,
        _flakiness_hint: Option<&str>,
    ) -> crucible_analyzer::Result<String> {
        Ok("analysis unavailable in this test fixture".to_string())
    }
}

fn job(task_id: &str, command: &str) -> JobMessage {
    JobMessage {
        task_id: task_id.to_string(),
        organization_id: Some("it-org".to_string()),
        image: "alpine:latest".to_string(),
        command: command.to_string(),
        config: ExecutionConfig {
            environment: RunEnvironment::Staging,
            base_url: None,
            retry_attempts: 0,
            env_vars: None,
        },
        tests: None,
        folder: None,
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn passing_job_runs_to_completion_and_persists_passed() {
    let docker = Docker::connect_with_local_defaults().expect("docker daemon reachable");
    let engine = Arc::new(DockerEngine::new(Arc::new(docker)));
    let store = Arc::new(InMemoryStore::new());
    let metrics = Arc::new(InMemoryMetricsCache::new());
    let analyzer = Arc::new(UnreachableAnalyzer);
    let notifier = Arc::new(NullNotifier);
    let reports_root = PathBuf::from(std::env::temp_dir()).join("crucible-it-reports");

    let pipeline = JobPipeline::new(
        engine,
        store.clone(),
        metrics,
        analyzer,
        notifier,
        JobPipelineConfig {
            reports_root,
            soft_timeout: std::time::Duration::from_secs(30),
            analysis_min_buffer_len: 50,
        },
    );

    let outcome = pipeline
        .process_job(job("it-task-pass", "echo ok"))
        .await;
    assert_eq!(outcome, PipelineOutcome::Processed);

    let stored = store
        .get_by_task_and_org("it-org", "it-task-pass")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.status.is_terminal());
    assert_ne!(stored.status, ExecutionStatus::Error);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn job_with_no_organization_is_rejected_without_touching_docker() {
    let docker = Docker::connect_with_local_defaults().expect("docker daemon reachable");
    let engine = Arc::new(DockerEngine::new(Arc::new(docker)));
    let store = Arc::new(InMemoryStore::new());
    let metrics = Arc::new(InMemoryMetricsCache::new());
    let analyzer = Arc::new(UnreachableAnalyzer);
    let notifier = Arc::new(NullNotifier);

    let pipeline = JobPipeline::new(
        engine,
        store,
        metrics,
        analyzer,
        notifier,
        JobPipelineConfig::default(),
    );

    let mut orphan = job("it-task-orphan", "echo ok");
    orphan.organization_id = None;

    let outcome = pipeline.process_job(orphan).await;
    assert_eq!(outcome, PipelineOutcome::RejectedMissingOrganization);
}
