// Shared domain types for the Crucible test execution platform.
//
// Every crate that touches an Execution or a Job Message depends on this
// crate rather than redefining its own view of the shape.

use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use tracing;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Auth Error: {0}")]
    Auth(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Queue Unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Container Orchestration Error: {0}")]
    ContainerOrchestration(String),

    #[error("Artifact Copy Error: {0}")]
    ArtifactCopy(String),

    #[error("AI Analysis Error: {0}")]
    AiAnalysis(String),

    #[error("Metrics Error: {0}")]
    Metrics(String),

    #[error("Store Error: {0}")]
    Store(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// The closed set of states an `Execution` can be in. Transitions are
/// enforced by the Worker (the only writer of non-`PENDING` states); this
/// type exists so matches on status stay exhaustive everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Analyzing,
    Passed,
    Failed,
    Unstable,
    Error,
}

impl ExecutionStatus {
    /// No further transition is legal once a terminal state is reached,
    /// short of deleting the record outright.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Passed
                | ExecutionStatus::Failed
                | ExecutionStatus::Unstable
                | ExecutionStatus::Error
        )
    }

    /// `PENDING -> RUNNING -> {PASSED, FAILED, UNSTABLE, ANALYZING, ERROR}`,
    /// `ANALYZING -> {FAILED, UNSTABLE}`. Every other edge is rejected.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Passed)
                | (Running, Failed)
                | (Running, Unstable)
                | (Running, Analyzing)
                | (Running, Error)
                | (Analyzing, Failed)
                | (Analyzing, Unstable)
        )
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Analyzing => "ANALYZING",
            ExecutionStatus::Passed => "PASSED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Unstable => "UNSTABLE",
            ExecutionStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEnvironment {
    Development,
    Staging,
    Production,
}

/// `Execution.config` from the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub environment: RunEnvironment,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub retry_attempts: u8,
    #[serde(default)]
    pub env_vars: Option<HashMap<String, String>>,
}

impl ExecutionConfig {
    pub const MAX_RETRY_ATTEMPTS: u8 = 5;
}

/// The central entity, identified jointly by `(task_id, organization_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub task_id: String,
    pub organization_id: String,
    pub status: ExecutionStatus,
    pub image: String,
    pub command: String,
    pub config: ExecutionConfig,
    #[serde(default)]
    pub tests: Option<Vec<String>>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub reports_base_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// A freshly-validated request becomes a `PENDING` record, created by
    /// the Producer and never re-created by the Worker.
    pub fn new_pending(
        task_id: String,
        organization_id: String,
        image: String,
        command: String,
        config: ExecutionConfig,
        tests: Option<Vec<String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            organization_id,
            status: ExecutionStatus::Pending,
            image,
            command,
            config,
            tests,
            start_time: now,
            end_time: None,
            output: String::new(),
            error: None,
            analysis: None,
            reports_base_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a status transition, rejecting illegal edges and bumping
    /// `updated_at`. Callers still own `end_time`/`output`/`error`.
    pub fn transition_to(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::Validation(format!(
                "illegal status transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Transient payload on the Job Queue. Created by the Producer, consumed
/// and acked by the Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub task_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub folder: Option<String>,
    pub config: ExecutionConfig,
    #[serde(default)]
    pub tests: Option<Vec<String>>,
}

/// One Realtime Hub room per organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub organization_id: String,
}

/// Realtime Hub rooms are named `org:{organizationId}`; publishes missing
/// an `organizationId` are rejected, not broadcast globally.
pub fn room_name(organization_id: &str) -> String {
    format!("org:{organization_id}")
}

/// One rolling window of recent execution durations, keyed by org+image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub organization_id: String,
    pub image: String,
    pub duration_ms: u64,
}

/// Metrics Cache key for a given org+image window.
pub fn metrics_key(organization_id: &str, image: &str) -> String {
    format!("metrics:{organization_id}:test:{image}")
}

/// Maximum number of recent durations retained per metrics key.
pub const METRICS_WINDOW_SIZE: usize = 10;

/// Fixed artifact alias mapping from container path to report directory,
/// applied in order, last writer wins under a shared alias.
pub const ARTIFACT_MAPPINGS: &[(&str, &str)] = &[
    ("/app/playwright-report", "native-report"),
    ("/app/pytest-report", "native-report"),
    ("/app/mochawesome-report", "native-report"),
    ("/app/allure-results", "allure-results"),
    ("/app/allure-report", "allure-report"),
];

/// Durable store schema revision, bumped on every migration added under
/// `crucible-store`'s migration set.
pub const SCHEMA_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_the_state_machine() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Passed));
        assert!(Running.can_transition_to(Analyzing));
        assert!(Running.can_transition_to(Error));
        assert!(Analyzing.can_transition_to(Failed));
        assert!(Analyzing.can_transition_to(Unstable));

        assert!(!Pending.can_transition_to(Passed));
        assert!(!Passed.can_transition_to(Running));
        assert!(!Analyzing.can_transition_to(Running));
        assert!(!Analyzing.can_transition_to(Pending));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        let terminals = [
            ExecutionStatus::Passed,
            ExecutionStatus::Failed,
            ExecutionStatus::Unstable,
            ExecutionStatus::Error,
        ];
        let all = [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Analyzing,
            ExecutionStatus::Passed,
            ExecutionStatus::Failed,
            ExecutionStatus::Unstable,
            ExecutionStatus::Error,
        ];
        for terminal in terminals {
            assert!(terminal.is_terminal());
            for next in all {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn execution_transition_rejects_illegal_edges() {
        let mut exec = Execution::new_pending(
            "t1".into(),
            "org-a".into(),
            "alpine:latest".into(),
            "npm test".into(),
            ExecutionConfig {
                environment: RunEnvironment::Staging,
                base_url: None,
                retry_attempts: 0,
                env_vars: None,
            },
            None,
        );
        assert!(exec.transition_to(ExecutionStatus::Passed).is_err());
        assert!(exec.transition_to(ExecutionStatus::Running).is_ok());
        assert!(exec.transition_to(ExecutionStatus::Passed).is_ok());
        assert!(exec.transition_to(ExecutionStatus::Running).is_err());
    }

    #[test]
    fn room_name_is_namespaced_by_org() {
        assert_eq!(room_name("acme"), "org:acme");
    }

    #[test]
    fn metrics_key_is_namespaced_by_org_and_image() {
        assert_eq!(metrics_key("acme", "alpine:latest"), "metrics:acme:test:alpine:latest");
    }

    #[test]
    fn job_message_round_trips_through_json() {
        let job = JobMessage {
            task_id: "t1".into(),
            organization_id: Some("org-a".into()),
            image: "alpine:latest".into(),
            command: "npm test".into(),
            folder: Some("e2e".into()),
            config: ExecutionConfig {
                environment: RunEnvironment::Staging,
                base_url: None,
                retry_attempts: 1,
                env_vars: None,
            },
            tests: None,
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: JobMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, "t1");
        assert_eq!(back.organization_id.as_deref(), Some("org-a"));
    }

    #[test]
    fn job_message_missing_organization_id_deserializes_to_none() {
        let json = r#"{"taskId":"t1","image":"alpine","command":"c","config":{"environment":"production","retryAttempts":0}}"#;
        let job: JobMessage = serde_json::from_str(json).unwrap();
        assert!(job.organization_id.is_none());
    }
}
