// The Worker's job-processing pipeline: the 13-step sequence from §4.2,
// orchestrating the Container Engine, Classifier, Injector, AI Analyzer,
// Metrics Cache and Durable Store for a single job, then notifying the
// Producer's internal endpoints so the Realtime Hub can fan the change out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crucible_analyzer::AiAnalyzer;
use crucible_api_types::{ExecutionLogBody, ExecutionUpdateBody};
use crucible_common::{Execution, ExecutionStatus, JobMessage};
use crucible_executor::{container_name, unpack_artifact_tar, ContainerEngine, ContainerSpec};
use crucible_metrics::MetricsCache;
use crucible_store::DurableStore;
use futures::StreamExt;
use tracing::{error, info, instrument, warn};

/// What the caller (the Worker's queue-consuming loop) should do with the
/// delivery once [`JobPipeline::process_job`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Processed to some terminal or already-durable state; ack.
    Processed,
    /// `organizationId` was absent; nack without requeue per §4.2 step 1.
    RejectedMissingOrganization,
}

/// Client for the Producer's trusted internal endpoints. Both calls are
/// best-effort: a failure is logged and swallowed, never propagated,
/// mirroring the "failures silently dropped, logs remain in the buffer"
/// policy from §4.2 step 6.
#[async_trait]
pub trait ProducerNotifier: Send + Sync {
    async fn notify_update(&self, body: ExecutionUpdateBody);
    async fn notify_log(&self, body: ExecutionLogBody);
}

/// reqwest-backed implementation posting to the Producer's internal bind
/// address, authenticated by a shared secret header rather than a tenant
/// JWT (these routes are never exposed to tenants).
pub struct HttpProducerNotifier {
    client: reqwest::Client,
    base_url: String,
    internal_token: String,
}

impl HttpProducerNotifier {
    pub fn new(base_url: String, internal_token: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a concrete timeout");
        Self {
            client,
            base_url,
            internal_token,
        }
    }
}

#[async_trait]
impl ProducerNotifier for HttpProducerNotifier {
    async fn notify_update(&self, body: ExecutionUpdateBody) {
        let url = format!("{}/executions/update", self.base_url);
        if let Err(e) = self
            .client
            .post(&url)
            .header("X-Internal-Token", &self.internal_token)
            .json(&body)
            .send()
            .await
        {
            warn!(error = %e, "best-effort update notification failed");
        }
    }

    async fn notify_log(&self, body: ExecutionLogBody) {
        let url = format!("{}/executions/log", self.base_url);
        if let Err(e) = self
            .client
            .post(&url)
            .header("X-Internal-Token", &self.internal_token)
            .json(&body)
            .send()
            .await
        {
            warn!(error = %e, "best-effort log notification failed");
        }
    }
}

fn update_body_for(execution: &Execution) -> ExecutionUpdateBody {
    ExecutionUpdateBody {
        task_id: execution.task_id.clone(),
        organization_id: execution.organization_id.clone(),
        status: Some(execution.status),
        output: Some(execution.output.clone()),
        error: execution.error.clone(),
        analysis: execution.analysis.clone(),
        end_time: execution.end_time,
        reports_base_url: execution.reports_base_url.clone(),
    }
}

/// Bound on queued-but-not-yet-POSTed log lines per job, per §5's
/// "never block the log stream for network" note.
const LOG_CHANNEL_CAPACITY: usize = 64;

pub struct JobPipelineConfig {
    pub reports_root: PathBuf,
    /// Soft per-job ceiling from §5: after this elapses the container is
    /// force-killed and the job marked `ERROR`.
    pub soft_timeout: Duration,
    /// Minimum buffer length before AI analysis is attempted, per §4.2
    /// step 9.
    pub analysis_min_buffer_len: usize,
}

impl Default for JobPipelineConfig {
    fn default() -> Self {
        Self {
            reports_root: PathBuf::from("/var/lib/crucible/reports"),
            soft_timeout: Duration::from_secs(3600),
            analysis_min_buffer_len: 50,
        }
    }
}

pub struct JobPipeline {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn DurableStore>,
    metrics: Arc<dyn MetricsCache>,
    analyzer: Arc<dyn AiAnalyzer>,
    notifier: Arc<dyn ProducerNotifier>,
    config: JobPipelineConfig,
}

impl JobPipeline {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn DurableStore>,
        metrics: Arc<dyn MetricsCache>,
        analyzer: Arc<dyn AiAnalyzer>,
        notifier: Arc<dyn ProducerNotifier>,
        config: JobPipelineConfig,
    ) -> Self {
        Self {
            engine,
            store,
            metrics,
            analyzer,
            notifier,
            config,
        }
    }

    #[instrument(skip(self, job), fields(task_id = %job.task_id, image = %job.image))]
    pub async fn process_job(&self, job: JobMessage) -> PipelineOutcome {
        let Some(organization_id) = job.organization_id.clone() else {
            warn!("job missing organizationId; rejecting without requeue");
            return PipelineOutcome::RejectedMissingOrganization;
        };

        self.run(job, organization_id).await;
        PipelineOutcome::Processed
    }

    async fn run(&self, job: JobMessage, organization_id: String) {
        let artifact_dir = self
            .config
            .reports_root
            .join(&organization_id)
            .join(&job.task_id);
        if let Err(e) = tokio::fs::create_dir_all(&artifact_dir).await {
            warn!(error = %e, "failed to prepare artifact directory, continuing without one");
        }

        let mut execution = self.load_or_create(&job, &organization_id).await;

        if execution.status == ExecutionStatus::Pending {
            let _ = execution.transition_to(ExecutionStatus::Running);
        }
        self.persist_and_notify(&execution).await;

        if let Err(e) = self.engine.pull_image(&job.image).await {
            warn!(error = %e, "image pull failed, continuing with any local cache");
        }

        let spec = ContainerSpec {
            name: container_name(&organization_id, &job.task_id),
            image: job.image.clone(),
            entrypoint: ContainerSpec::entrypoint_for(job.folder.as_deref()),
            env: crucible_injector::build_environment(
                &job.task_id,
                job.config.base_url.as_deref().unwrap_or_default(),
                job.config.env_vars.as_ref(),
                |key| std::env::var(key).ok(),
            ),
            host_gateway: true,
        };

        let container_id = match self.engine.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.finish_with_error(&mut execution, format!("container create failed: {e}"))
                    .await;
                return;
            }
        };

        // Attach before start so no output between create and start is lost.
        let mut log_stream = match self.engine.attach_logs(&container_id).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.engine.remove_container(&container_id).await;
                self.finish_with_error(&mut execution, format!("log attach failed: {e}"))
                    .await;
                return;
            }
        };

        if let Err(e) = self.engine.start_container(&container_id).await {
            let _ = self.engine.remove_container(&container_id).await;
            self.finish_with_error(&mut execution, format!("container start failed: {e}"))
                .await;
            return;
        }

        // Log lines are handed off to a drain task over a bounded channel so
        // a slow notify_log POST never stalls the container's own log
        // stream; under backpressure a line is dropped rather than buffered
        // without limit.
        let (log_tx, mut log_rx) = tokio::sync::mpsc::channel::<ExecutionLogBody>(LOG_CHANNEL_CAPACITY);
        let notifier = Arc::clone(&self.notifier);
        let drain_handle = tokio::spawn(async move {
            while let Some(body) = log_rx.recv().await {
                notifier.notify_log(body).await;
            }
        });

        // The soft timeout races the whole post-start phase, not just the
        // container wait: a container that hangs while holding its log
        // stream open (running, emitting nothing) must still be force-killed
        // rather than blocking forever in the drain loop below.
        let mut buffer = String::new();
        let run_result = tokio::time::timeout(self.config.soft_timeout, async {
            while let Some(chunk) = log_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        let text = crucible_injector::strip_ansi(&bytes);
                        buffer.push_str(&text);
                        if log_tx
                            .try_send(ExecutionLogBody {
                                task_id: job.task_id.clone(),
                                organization_id: organization_id.clone(),
                                log: text,
                            })
                            .is_err()
                        {
                            warn!("log notification channel full, dropping a log chunk");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "log stream read error, stopping log consumption");
                        break;
                    }
                }
            }
            self.engine.wait_container(&container_id).await
        })
        .await;

        drop(log_tx);
        let _ = drain_handle.await;

        let exit_code = match run_result {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                let _ = self.engine.remove_container(&container_id).await;
                self.finish_with_error(&mut execution, format!("container wait failed: {e}"))
                    .await;
                return;
            }
            Err(_elapsed) => {
                warn!("soft job timeout exceeded, force-killing container");
                let _ = self.engine.remove_container(&container_id).await;
                self.finish_with_error(&mut execution, "soft job timeout exceeded".to_string())
                    .await;
                return;
            }
        };

        let final_status = crucible_classifier::classify(exit_code, &buffer);
        execution.output = buffer.clone();

        if matches!(final_status, ExecutionStatus::Failed | ExecutionStatus::Unstable)
            && buffer.len() >= self.config.analysis_min_buffer_len
        {
            if execution.transition_to(ExecutionStatus::Analyzing).is_ok() {
                self.persist_and_notify(&execution).await;
            }
            let flakiness_hint = (final_status == ExecutionStatus::Unstable)
                .then_some("test passed only after one or more retries");
            match self.analyzer.analyze(&buffer, &job.image, flakiness_hint).await {
                Ok(analysis) => execution.analysis = Some(analysis),
                Err(e) => {
                    warn!(error = %e, "AI analysis failed, recording fallback");
                    execution.analysis = Some(crucible_analyzer::fallback_analysis(&e.to_string()));
                }
            }
        }

        if let Err(e) = execution.transition_to(final_status) {
            error!(error = %e, "classifier produced an illegal status transition");
        }
        execution.end_time = Some(chrono::Utc::now());

        self.copy_artifacts(&container_id, &artifact_dir).await;
        execution.reports_base_url = Some(format!(
            "/reports/{organization_id}/{}",
            job.task_id
        ));

        let duration_ms = execution
            .end_time
            .map(|end| (end - execution.start_time).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        if let Err(e) = self
            .metrics
            .record_duration(&organization_id, &job.image, duration_ms)
            .await
        {
            warn!(error = %e, "metrics sample failed");
        }

        self.persist_and_notify(&execution).await;

        if let Err(e) = self.engine.remove_container(&container_id).await {
            warn!(error = %e, "final container removal failed");
        }
    }

    async fn copy_artifacts(&self, container_id: &str, artifact_dir: &std::path::Path) {
        for &(container_path, alias) in crucible_common::ARTIFACT_MAPPINGS {
            match self.engine.copy_artifact(container_id, container_path).await {
                Ok(Some(tar_bytes)) => {
                    let dest = artifact_dir.join(alias);
                    let result =
                        tokio::task::spawn_blocking(move || unpack_artifact_tar(&tar_bytes, &dest))
                            .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, container_path, "artifact unpack failed"),
                        Err(e) => warn!(error = %e, container_path, "artifact unpack task panicked"),
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, container_path, "artifact copy failed"),
            }
        }
    }

    async fn finish_with_error(&self, execution: &mut Execution, message: String) {
        if !execution.status.is_terminal() {
            let _ = execution.transition_to(ExecutionStatus::Error);
        }
        execution.error = Some(message);
        execution.end_time = Some(chrono::Utc::now());
        self.persist_and_notify(execution).await;
    }

    async fn persist_and_notify(&self, execution: &Execution) {
        if let Err(e) = self.store.upsert(execution).await {
            error!(error = %e, "durable store write failed");
        }
        // Durable-before-broadcast: the upsert above has already
        // committed by the time this notification goes out.
        self.notifier.notify_update(update_body_for(execution)).await;
    }

    async fn load_or_create(&self, job: &JobMessage, organization_id: &str) -> Execution {
        match self
            .store
            .get_by_task_and_org(organization_id, &job.task_id)
            .await
        {
            Ok(Some(execution)) => execution,
            _ => {
                info!("no existing record found, creating one (redelivery-safe upsert)");
                Execution::new_pending(
                    job.task_id.clone(),
                    organization_id.to_string(),
                    job.image.clone(),
                    job.command.clone(),
                    job.config.clone(),
                    job.tests.clone(),
                )
            }
        }
    }
}
