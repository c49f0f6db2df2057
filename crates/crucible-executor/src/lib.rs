// Container Engine: pulls images, creates/starts/waits/removes the fixed
// single-shot test container, streams its combined stdout+stderr, and
// archives fixed paths out of it once it exits.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use docktopus::bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerConfig, CreateContainerOptions,
    DownloadFromContainerOptions, LogOutput, RemoveContainerOptions, WaitContainerOptions,
};
use docktopus::bollard::errors::Error as BollardError;
use docktopus::bollard::image::CreateImageOptions;
use docktopus::bollard::models::HostConfig;
use docktopus::bollard::Docker;
use futures::{Stream, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("image pull failed: {0}")]
    ImagePull(#[source] BollardError),
    #[error("container create failed: {0}")]
    ContainerCreate(#[source] BollardError),
    #[error("container start failed: {0}")]
    ContainerStart(#[source] BollardError),
    #[error("container wait failed: {0}")]
    ContainerWait(String),
    #[error("container log attach failed: {0}")]
    LogAttach(#[source] BollardError),
    #[error("container remove failed: {0}")]
    ContainerRemove(#[source] BollardError),
    #[error("artifact copy failed: {0}")]
    ArtifactCopy(String),
    #[error("internal executor error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

impl From<ExecutorError> for crucible_common::CoreError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::ArtifactCopy(msg) => crucible_common::CoreError::ArtifactCopy(msg),
            other => crucible_common::CoreError::ContainerOrchestration(other.to_string()),
        }
    }
}

/// The fixed container contract from §4.2/§6: a single entrypoint, an
/// environment prepared by the Injector, and an optional host-gateway hop.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub env: HashMap<String, String>,
    pub host_gateway: bool,
}

impl ContainerSpec {
    /// `/bin/sh /app/entrypoint.sh {folder|"all"}` per §4.2 step 5.
    pub fn entrypoint_for(folder: Option<&str>) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "/app/entrypoint.sh".to_string(),
            folder.unwrap_or("all").to_string(),
        ]
    }
}

pub type LogChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// The Container Engine from §2: an external collaborator abstracted
/// behind a trait so the Worker's pipeline can be exercised without a real
/// daemon in unit tests.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Best-effort: on failure the caller should log and continue using
    /// whatever local image cache exists, per §4.2 step 4.
    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Must be called before [`Self::start_container`] so no output is
    /// missed between create and start.
    async fn attach_logs(&self, container_id: &str) -> Result<LogChunkStream>;

    async fn wait_container(&self, container_id: &str) -> Result<i64>;

    /// `None` means the path did not exist in the container; callers
    /// treat that as a no-op, never a hard failure.
    async fn copy_artifact(&self, container_id: &str, container_path: &str) -> Result<Option<Vec<u8>>>;

    /// Force-removes regardless of running state; the only cleanup path,
    /// called on every exit including thrown-exception paths.
    async fn remove_container(&self, container_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct DockerEngine {
    docker: Arc<Docker>,
}

impl DockerEngine {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    #[instrument(skip(self), fields(image))]
    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(ExecutorError::ImagePull)?;
        }
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = if spec.host_gateway && cfg!(target_os = "linux") {
            Some(HostConfig {
                extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
                ..Default::default()
            })
        } else {
            None
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config,
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(ExecutorError::ContainerCreate)?;

        info!(container_id = %created.id, "container created");
        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<docktopus::bollard::container::StartContainerOptions<String>>)
            .await
            .map_err(ExecutorError::ContainerStart)
    }

    async fn attach_logs(&self, container_id: &str) -> Result<LogChunkStream> {
        let attach_options = AttachContainerOptions::<String> {
            stream: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, .. } = self
            .docker
            .attach_container(container_id, Some(attach_options))
            .await
            .map_err(ExecutorError::LogAttach)?;

        let chunks = output
            .map_ok(|entry| match entry {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => message.to_vec(),
                LogOutput::StdIn { message } | LogOutput::Console { message } => message.to_vec(),
            })
            .map_err(ExecutorError::LogAttach);

        Ok(Box::pin(chunks))
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match stream.next().await {
            Some(Ok(body)) => Ok(body.status_code),
            Some(Err(e)) => Err(ExecutorError::ContainerWait(e.to_string())),
            None => Err(ExecutorError::ContainerWait(
                "wait stream ended unexpectedly".to_string(),
            )),
        }
    }

    #[instrument(skip(self), fields(container_id, container_path))]
    async fn copy_artifact(&self, container_id: &str, container_path: &str) -> Result<Option<Vec<u8>>> {
        let mut stream = self.docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: container_path.to_string(),
            }),
        );
        let mut tar_bytes = Vec::new();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => tar_bytes.extend_from_slice(&chunk),
                Some(Err(BollardError::DockerResponseServerError { status_code, .. })) if status_code == 404 => {
                    debug!(container_path, "artifact path absent, skipping");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(ExecutorError::ArtifactCopy(e.to_string())),
                None => break,
            }
        }
        Ok(Some(tar_bytes))
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(container_id, error = %e, "container remove failed");
                Err(ExecutorError::ContainerRemove(e))
            }
        }
    }
}

/// Container name for a given tenant/task pair, per §4.2 step 5 and the
/// cleanup invariant in §8.5.
pub fn container_name(organization_id: &str, task_id: &str) -> String {
    format!("org_{organization_id}_task_{task_id}")
}

/// Unpacks a tar archive returned by [`ContainerEngine::copy_artifact`]
/// into `dest_dir`, replacing any existing directory atomically so
/// concurrent last-writer-wins collisions under the same alias resolve
/// cleanly (§4.2 step 10).
///
/// Docker's `download_from_container` archive wraps the copied path in a
/// single top-level directory entry named after its basename; when that
/// shape is present we promote its contents rather than nesting one level
/// deeper than the alias implies.
pub fn unpack_artifact_tar(tar_bytes: &[u8], dest_dir: &std::path::Path) -> std::io::Result<()> {
    let scratch = dest_dir.with_extension("tmp-unpack");
    if scratch.exists() {
        std::fs::remove_dir_all(&scratch)?;
    }
    std::fs::create_dir_all(&scratch)?;
    let mut archive = tar::Archive::new(tar_bytes);
    archive.unpack(&scratch)?;

    let entries: Vec<_> = std::fs::read_dir(&scratch)?.filter_map(|e| e.ok()).collect();
    let source = if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        entries[0].path()
    } else {
        scratch.clone()
    };

    if dest_dir.exists() {
        std::fs::remove_dir_all(dest_dir)?;
    }
    std::fs::rename(&source, dest_dir)?;
    if scratch.exists() {
        std::fs::remove_dir_all(&scratch)?;
    }
    Ok(())
}
