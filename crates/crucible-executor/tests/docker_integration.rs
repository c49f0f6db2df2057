use std::collections::HashMap;
use std::sync::Arc;

use crucible_executor::{container_name, ContainerEngine, ContainerSpec, DockerEngine};
use docktopus::bollard::Docker;
use futures::TryStreamExt;

async fn engine() -> DockerEngine {
    let docker = Docker::connect_with_local_defaults().expect("docker daemon reachable");
    DockerEngine::new(Arc::new(docker))
}

#[tokio::test]
#[ignore] // Requires Docker
async fn run_echo_container_to_completion() {
    let engine = engine().await;
    let name = container_name("it-org", "it-task-echo");
    let spec = ContainerSpec {
        name: name.clone(),
        image: "alpine:latest".to_string(),
        entrypoint: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo hello-crucible".to_string(),
        ],
        env: HashMap::new(),
        host_gateway: false,
    };

    engine.pull_image(&spec.image).await.unwrap();
    let container_id = engine.create_container(&spec).await.unwrap();
    let logs = engine.attach_logs(&container_id).await.unwrap();
    engine.start_container(&container_id).await.unwrap();

    let chunks: Vec<Vec<u8>> = logs.try_collect().await.unwrap();
    let combined = String::from_utf8(chunks.concat()).unwrap();
    assert!(combined.contains("hello-crucible"));

    let exit_code = engine.wait_container(&container_id).await.unwrap();
    assert_eq!(exit_code, 0);

    engine.remove_container(&container_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn nonzero_exit_is_reported_without_error() {
    let engine = engine().await;
    let name = container_name("it-org", "it-task-fail");
    let spec = ContainerSpec {
        name: name.clone(),
        image: "alpine:latest".to_string(),
        entrypoint: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()],
        env: HashMap::new(),
        host_gateway: false,
    };

    engine.pull_image(&spec.image).await.unwrap();
    let container_id = engine.create_container(&spec).await.unwrap();
    engine.start_container(&container_id).await.unwrap();
    let exit_code = engine.wait_container(&container_id).await.unwrap();
    assert_eq!(exit_code, 7);

    engine.remove_container(&container_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn missing_artifact_path_returns_none_not_an_error() {
    let engine = engine().await;
    let name = container_name("it-org", "it-task-artifact");
    let spec = ContainerSpec {
        name: name.clone(),
        image: "alpine:latest".to_string(),
        entrypoint: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
        env: HashMap::new(),
        host_gateway: false,
    };

    engine.pull_image(&spec.image).await.unwrap();
    let container_id = engine.create_container(&spec).await.unwrap();
    engine.start_container(&container_id).await.unwrap();
    engine.wait_container(&container_id).await.unwrap();

    let artifact = engine
        .copy_artifact(&container_id, "/no/such/path")
        .await
        .unwrap();
    assert!(artifact.is_none());

    engine.remove_container(&container_id).await.unwrap();
}
