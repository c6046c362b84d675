use axum::{
    Extension, Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use notebook_core::{FieldErrors, ResourceRequest, ServerKey, ServerRecord, ServerStatus, StopOutcome};
use serde::Serialize;

use crate::{
    error::ControlError,
    security::{self, RequestMeta},
    state::AppState,
};

/// Caller identity as established by the authentication layer in front of us.
pub const CALLER_HEADER: &str = "x-notebook-user";

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub request_id: String,
    pub field_errors: FieldErrors,
    pub hint: Option<String>,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    fn from_control(err: ControlError, meta: &RequestMeta) -> Self {
        let status = match &err {
            ControlError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ControlError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::LaunchFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let hint = match &err {
            ControlError::NotFound(_) => Some("start a notebook server first".to_string()),
            ControlError::StoreUnavailable(_) => Some("retry later".to_string()),
            _ => None,
        };
        if status.is_server_error() {
            tracing::error!(request_id = %meta.request_id, error = %err, "request failed");
        }
        let code = err.code().to_string();
        let message = err.to_string();
        let field_errors = match err {
            ControlError::InvalidRequest { field_errors, .. } => field_errors,
            _ => FieldErrors::new(),
        };
        Self {
            code,
            message,
            request_id: meta.request_id.clone(),
            field_errors,
            hint,
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn resolve_key(
    state: &AppState,
    headers: &HeaderMap,
    project: &str,
) -> Result<ServerKey, ControlError> {
    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let owner = state.identity.resolve_system_user(project, caller).await?;
    Ok(ServerKey::new(project, owner))
}

async fn list(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Path(project): Path<String>,
) -> ApiResult<Vec<ServerRecord>> {
    // Listing is project-wide, but only for callers that resolve in the project.
    resolve_key(&state, &headers, &project)
        .await
        .map_err(|e| ApiError::from_control(e, &meta))?;
    state
        .controller
        .list(&project)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_control(e, &meta))
}

async fn running(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Path(project): Path<String>,
) -> ApiResult<ServerStatus> {
    let result = async {
        let key = resolve_key(&state, &headers, &project).await?;
        state.controller.status(&key).await
    }
    .await;
    result.map(Json).map_err(|e| ApiError::from_control(e, &meta))
}

async fn start(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Path(project): Path<String>,
    body: Result<Json<ResourceRequest>, JsonRejection>,
) -> ApiResult<ServerRecord> {
    let result = async {
        let key = resolve_key(&state, &headers, &project).await?;
        let Json(request) = body.map_err(|e| ControlError::invalid(e.body_text()))?;
        state.controller.start(&key, &request).await
    }
    .await;
    result.map(Json).map_err(|e| ApiError::from_control(e, &meta))
}

#[derive(Debug, Serialize)]
struct StopResponse {
    outcome: StopOutcome,
}

async fn stop(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Path(project): Path<String>,
) -> ApiResult<StopResponse> {
    let result = async {
        let key = resolve_key(&state, &headers, &project).await?;
        state.controller.stop(&key).await
    }
    .await;
    result
        .map(|outcome| Json(StopResponse { outcome }))
        .map_err(|e| ApiError::from_control(e, &meta))
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/projects/:project/notebooks", get(list))
        .route("/projects/:project/notebooks/running", get(running))
        .route("/projects/:project/notebooks/start", post(start))
        .route("/projects/:project/notebooks/stop", delete(stop))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
