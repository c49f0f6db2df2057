// Wire-level DTOs for the Producer's tenant-facing and internal HTTP
// surfaces. Kept separate from `crucible_common::Execution` so the
// request/response shapes can evolve independently of the durable record.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use crucible_common::{CoreError, Execution, ExecutionConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// The four user-visible error kinds from §7: everything else is absorbed
/// into the durable execution record rather than surfaced to a caller.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("not found")]
    NotFound,

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => ApiError::Validation(msg),
            CoreError::Auth(msg) => ApiError::Auth(msg),
            CoreError::NotFound(_) => ApiError::NotFound,
            CoreError::QueueUnavailable(msg) => ApiError::QueueUnavailable(msg),
            // Every other CoreError kind is a server-side fault that should
            // already have been absorbed into the execution record before
            // reaching an HTTP handler; surface it as a 500 rather than
            // panic the request.
            other => ApiError::QueueUnavailable(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            ApiError::Auth(_) => (StatusCode::UNAUTHORIZED, "AUTH"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::QueueUnavailable(_) => (StatusCode::INTERNAL_SERVER_ERROR, "QUEUE_UNAVAILABLE"),
        };
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

/// `POST /api/execution-request` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequestBody {
    pub task_id: String,
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub folder: Option<String>,
    pub config: ExecutionConfig,
    #[serde(default)]
    pub tests: Option<Vec<String>>,
}

impl ExecutionRequestBody {
    /// taskId/image/command non-empty, retryAttempts within range. `config`
    /// itself is already schema-validated by serde deserialization failing
    /// closed on a malformed shape before this ever runs.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.task_id.trim().is_empty() {
            return Err(ApiError::Validation("taskId must not be empty".into()));
        }
        if self.image.trim().is_empty() {
            return Err(ApiError::Validation("image must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(ApiError::Validation("command must not be empty".into()));
        }
        if self.config.retry_attempts > ExecutionConfig::MAX_RETRY_ATTEMPTS {
            return Err(ApiError::Validation(format!(
                "retryAttempts must be <= {}",
                ExecutionConfig::MAX_RETRY_ATTEMPTS
            )));
        }
        Ok(())
    }
}

/// `POST /api/execution-request` success body: `200 {status, taskId}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequestResponse {
    pub status: crucible_common::ExecutionStatus,
    pub task_id: String,
}

/// `DELETE /api/executions/{taskId}` success body.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
}

impl DeleteResponse {
    pub fn success() -> Self {
        Self { success: true }
    }
}

/// `GET /api/auth/me` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMeResponse {
    pub user: AuthMeUser,
    pub organization: AuthMeOrganization,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthMeUser {
    pub id: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthMeOrganization {
    pub id: String,
    pub name: String,
}

/// `POST /executions/update` internal body. Trusted: only reachable via
/// the internal bind address, never exposed to tenant tokens. Also sent
/// by the Worker, which is why it derives `Serialize` in addition to the
/// `Deserialize` the Producer's handler needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionUpdateBody {
    pub task_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub status: Option<crucible_common::ExecutionStatus>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub reports_base_url: Option<String>,
}

/// `POST /executions/log` internal body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogBody {
    pub task_id: String,
    pub organization_id: String,
    pub log: String,
}

/// `GET /api/executions` response: the caller's most recent 50 records.
pub type ExecutionsListResponse = Vec<Execution>;

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_common::RunEnvironment;

    fn sample_body() -> ExecutionRequestBody {
        ExecutionRequestBody {
            task_id: "t1".into(),
            image: "alpine:latest".into(),
            command: "npm test".into(),
            folder: None,
            config: ExecutionConfig {
                environment: RunEnvironment::Staging,
                base_url: None,
                retry_attempts: 0,
                env_vars: None,
            },
            tests: None,
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_request() {
        assert!(sample_body().validate().is_ok());
    }

    #[test]
    fn validate_rejects_an_empty_task_id() {
        let mut body = sample_body();
        body.task_id = "  ".into();
        assert!(matches!(body.validate(), Err(ApiError::Validation(_))));
    }

    #[test]
    fn validate_rejects_retry_attempts_above_the_maximum() {
        let mut body = sample_body();
        body.config.retry_attempts = 6;
        assert!(matches!(body.validate(), Err(ApiError::Validation(_))));
    }

    #[test]
    fn execution_update_body_deserializes_partial_fields() {
        let json = r#"{"taskId":"t1","organizationId":"org-a","status":"RUNNING"}"#;
        let body: ExecutionUpdateBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.task_id, "t1");
        assert!(body.output.is_none());
    }

    #[test]
    fn core_not_found_maps_to_api_not_found() {
        let err: ApiError = CoreError::NotFound("x".into()).into();
        assert!(matches!(err, ApiError::NotFound));
    }
}
