// Producer: the tenant-facing HTTP surface plus the trusted internal
// surface the Worker uses to push status updates into the Realtime Hub.
//
// Concurrency model: every handler is independent; the only state shared
// across requests is the Realtime Hub's room table (see crucible-realtime)
// and the injected store/queue clients, all of which are already
// internally synchronized.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{FromRef, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use crucible_api_types::{
    ApiError, AuthMeOrganization, AuthMeResponse, AuthMeUser, DeleteResponse,
    ExecutionLogBody, ExecutionRequestBody, ExecutionRequestResponse, ExecutionUpdateBody,
    ExecutionsListResponse,
};
use crucible_auth::{AuthenticatedUser, JwtVerifier};
use crucible_common::{Execution, ExecutionStatus, JobMessage};
use crucible_queue::JobQueue;
use crucible_realtime::{RealtimeHub, RealtimeState};
use crucible_store::DurableStore;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;
use tracing::{instrument, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DurableStore>,
    pub queue: Arc<dyn JobQueue>,
    pub hub: RealtimeHub,
    pub jwt_verifier: JwtVerifier,
    pub internal_token: String,
    pub reports_root: PathBuf,
    /// Origin the dashboard is served from; CORS is scoped to it rather
    /// than permissive, since tenant isolation is a stated invariant.
    pub dashboard_origin: String,
}

impl FromRef<AppState> for JwtVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_verifier.clone()
    }
}

impl RealtimeState for AppState {
    fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    fn jwt_verifier(&self) -> &JwtVerifier {
        &self.jwt_verifier
    }
}

/// Extractor guarding the internal surface (`/executions/update`,
/// `/executions/log`) behind the shared secret the Worker's
/// `HttpProducerNotifier` sends as `X-Internal-Token`. Never exposed to
/// tenant tokens.
struct InternalCaller;

impl<S> axum::extract::FromRequestParts<S> for InternalCaller
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let provided = parts
            .headers
            .get("X-Internal-Token")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Auth("missing internal token".into()))?;
        if provided != app_state.internal_token {
            return Err(ApiError::Auth("invalid internal token".into()));
        }
        Ok(InternalCaller)
    }
}

pub fn create_app(state: AppState) -> Router {
    let cors = match state.dashboard_origin.parse::<axum::http::HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        Err(_) => {
            warn!(
                origin = %state.dashboard_origin,
                "dashboard origin is not a valid header value, denying all cross-origin requests"
            );
            CorsLayer::new()
        }
    };

    Router::new()
        .route("/api/execution-request", post(execution_request_handler))
        .route("/api/executions", get(list_executions_handler))
        .route(
            "/api/executions/:task_id",
            axum::routing::delete(delete_execution_handler),
        )
        .route("/api/auth/me", get(auth_me_handler))
        .route("/reports/:organization_id/:task_id/*rest", get(report_handler))
        .route("/executions/update", post(executions_update_handler))
        .route("/executions/log", post(executions_log_handler))
        .route("/ws", get(crucible_realtime::ws_realtime_handler::<AppState>))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

#[instrument(skip(state, body), fields(task_id = %body.task_id))]
async fn execution_request_handler(
    AuthenticatedUser(claims): AuthenticatedUser,
    State(state): State<AppState>,
    Json(body): Json<ExecutionRequestBody>,
) -> Result<Json<ExecutionRequestResponse>, ApiError> {
    body.validate()?;

    let execution = Execution::new_pending(
        body.task_id.clone(),
        claims.organization_id.clone(),
        body.image.clone(),
        body.command.clone(),
        body.config.clone(),
        body.tests.clone(),
    );
    state.store.upsert(&execution).await.map_err(crucible_common::CoreError::from)?;

    let job = JobMessage {
        task_id: body.task_id.clone(),
        organization_id: Some(claims.organization_id.clone()),
        image: body.image,
        command: body.command,
        folder: body.folder,
        config: body.config,
        tests: body.tests,
    };

    if let Err(e) = state.queue.publish(&job).await {
        // No durable record is left behind on enqueue failure: mark the
        // row ERROR rather than leaving a dangling PENDING one.
        let mut failed = execution.clone();
        failed.status = ExecutionStatus::Error;
        failed.error = Some(format!("failed to enqueue job: {e}"));
        let _ = state.store.upsert(&failed).await;
        warn!(task_id = %body.task_id, error = %e, "enqueue failed, marking execution ERROR");
        return Err(ApiError::QueueUnavailable(e.to_string()));
    }

    state.hub.publish_update(&claims.organization_id, execution.clone());

    Ok(Json(ExecutionRequestResponse {
        status: execution.status,
        task_id: execution.task_id,
    }))
}

async fn list_executions_handler(
    AuthenticatedUser(claims): AuthenticatedUser,
    State(state): State<AppState>,
) -> Result<Json<ExecutionsListResponse>, ApiError> {
    let executions = state
        .store
        .list_recent_by_org(&claims.organization_id)
        .await
        .map_err(crucible_common::CoreError::from)?;
    Ok(Json(executions))
}

async fn delete_execution_handler(
    AuthenticatedUser(claims): AuthenticatedUser,
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state
        .store
        .delete_by_task_and_org(&claims.organization_id, &task_id)
        .await
        .map_err(crucible_common::CoreError::from)?;
    if !deleted {
        // Same response whether the row belongs to another tenant or
        // never existed: this is the cross-tenant isolation boundary.
        return Err(ApiError::NotFound);
    }
    Ok(Json(DeleteResponse::success()))
}

async fn auth_me_handler(
    AuthenticatedUser(claims): AuthenticatedUser,
) -> Json<AuthMeResponse> {
    Json(AuthMeResponse {
        user: AuthMeUser {
            id: claims.user_id,
            role: claims.role,
        },
        organization: AuthMeOrganization {
            id: claims.organization_id.clone(),
            name: claims.organization_id,
        },
    })
}

async fn executions_update_handler(
    _internal: InternalCaller,
    State(state): State<AppState>,
    Json(body): Json<ExecutionUpdateBody>,
) -> StatusCode {
    route_update_to_room(&state, body);
    StatusCode::OK
}

async fn executions_log_handler(
    _internal: InternalCaller,
    State(state): State<AppState>,
    Json(body): Json<ExecutionLogBody>,
) -> StatusCode {
    state.hub.publish_log(&body.organization_id, body.task_id, body.log);
    StatusCode::OK
}

/// Folds a partial `ExecutionUpdateBody` into a broadcastable `Execution`
/// snapshot. Rather than guess at missing fields, reads the current
/// durable row back out so the broadcast always carries full state —
/// the Worker already persisted before calling this endpoint, per the
/// durable-before-broadcast ordering in §5.
fn route_update_to_room(state: &AppState, body: ExecutionUpdateBody) {
    let state = state.clone();
    tokio::spawn(async move {
        match state
            .store
            .get_by_task_and_org(&body.organization_id, &body.task_id)
            .await
        {
            Ok(Some(execution)) => state.hub.publish_update(&body.organization_id, execution),
            Ok(None) => warn!(
                task_id = %body.task_id,
                organization_id = %body.organization_id,
                "update notification for unknown execution, skipping broadcast"
            ),
            Err(e) => warn!(error = %e, "failed to reload execution for broadcast"),
        }
    });
}

async fn report_handler(
    AuthenticatedUser(claims): AuthenticatedUser,
    State(state): State<AppState>,
    Path((organization_id, task_id, rest)): Path<(String, String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    if claims.organization_id != organization_id {
        // Masked as NOT_FOUND rather than AUTH: existence of another
        // tenant's artifacts must not be distinguishable from absence.
        return Err(ApiError::NotFound);
    }

    let base = state.reports_root.join(&organization_id).join(&task_id);
    let requested = base.join(&rest);

    // Path-traversal guard: the resolved path must stay under `base`.
    let normalized = normalize(&requested);
    if !normalized.starts_with(&normalize(&base)) {
        return Err(ApiError::NotFound);
    }

    let serve = ServeFile::new(&normalized);
    match serve.oneshot(request).await {
        Ok(response) => Ok(response.map(axum::body::Body::new).into_response()),
        Err(_) => Err(ApiError::NotFound),
    }
}

/// Lexical normalization (no filesystem access, so it works for paths
/// that don't exist yet): resolves `.`/`..` components without touching
/// disk, unlike `std::fs::canonicalize`.
fn normalize(path: &FsPath) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
