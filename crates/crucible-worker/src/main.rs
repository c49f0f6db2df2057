use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crucible_executor::DockerEngine;
use crucible_metrics::RedisMetricsCache;
use crucible_queue::{JobQueue, RedisQueue};
use crucible_store::PostgresStore;
use crucible_worker_core::{HttpProducerNotifier, JobPipeline, JobPipelineConfig, PipelineOutcome};
use docktopus::bollard::Docker;
use tracing::{error, info, warn};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let producer_base_url =
        std::env::var("PRODUCER_INTERNAL_URL").expect("PRODUCER_INTERNAL_URL must be set");
    let internal_token =
        std::env::var("INTERNAL_SHARED_TOKEN").expect("INTERNAL_SHARED_TOKEN must be set");
    let analyzer_url = std::env::var("AI_ANALYZER_URL").expect("AI_ANALYZER_URL must be set");

    let analyzer_timeout_ms: u64 = env_or("AI_ANALYZER_TIMEOUT_MS", "30000").parse().unwrap_or(30_000);
    let notifier_timeout_ms: u64 = env_or("PRODUCER_NOTIFY_TIMEOUT_MS", "5000").parse().unwrap_or(5_000);
    let soft_timeout_secs: u64 = env_or("SOFT_JOB_TIMEOUT_SECS", "3600").parse().unwrap_or(3_600);
    let reports_root = PathBuf::from(env_or("REPORTS_ROOT", "/var/lib/crucible/reports"));

    info!("connecting to docker daemon...");
    let docker = Arc::new(Docker::connect_with_local_defaults()?);
    let engine = Arc::new(DockerEngine::new(docker));

    info!("connecting to durable store...");
    let store = Arc::new(PostgresStore::connect(&database_url).await?);

    info!("connecting to job queue...");
    let queue = Arc::new(RedisQueue::new(&redis_url)?);

    let metrics = Arc::new(RedisMetricsCache::new(&redis_url)?);
    let analyzer = Arc::new(crucible_analyzer::HttpAnalyzer::new(
        analyzer_url,
        Duration::from_millis(analyzer_timeout_ms),
    ));
    let notifier = Arc::new(HttpProducerNotifier::new(
        producer_base_url,
        internal_token,
        Duration::from_millis(notifier_timeout_ms),
    ));

    let pipeline = JobPipeline::new(
        engine,
        store,
        metrics,
        analyzer,
        notifier,
        JobPipelineConfig {
            reports_root,
            soft_timeout: Duration::from_secs(soft_timeout_secs),
            analysis_min_buffer_len: 50,
        },
    );

    info!("worker ready, consuming with prefetch=1");
    run_consume_loop(queue, pipeline).await;

    Ok(())
}

/// Single in-flight job at a time (prefetch=1, per §5): the next
/// `consume` isn't issued until the previous delivery is acked or
/// nacked. A Ctrl-C is observed between jobs rather than mid-job, so an
/// in-flight container always finishes its pipeline run (including
/// cleanup) before the process exits.
async fn run_consume_loop(queue: Arc<dyn JobQueue>, pipeline: JobPipeline) {
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    loop {
        let delivery = tokio::select! {
            result = queue.consume() => result,
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping before next job");
                break;
            }
        };

        let delivery = match delivery {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                info!("queue closed, shutting down");
                break;
            }
            Err(e) => {
                error!(error = %e, "failed to consume from queue, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let outcome = pipeline.process_job(delivery.job).await;
        let settle_result = match outcome {
            PipelineOutcome::Processed => queue.ack(&delivery.delivery_id).await,
            PipelineOutcome::RejectedMissingOrganization => {
                warn!(delivery_id = %delivery.delivery_id, "nacking job with no organizationId");
                queue.nack(&delivery.delivery_id).await
            }
        };
        if let Err(e) = settle_result {
            error!(delivery_id = %delivery.delivery_id, error = %e, "failed to settle delivery");
        }
    }
}
