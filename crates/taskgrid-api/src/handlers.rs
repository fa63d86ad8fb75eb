//! REST API handlers.
//!
//! Each handler calls one `Engine` operation and returns a JSON envelope.
//! Engine errors map to status codes by kind.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskgrid_core::{Mode, Phase, Settings, TaskGraph};
use taskgrid_engine::EngineError;
use tracing::warn;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiError>,
}

#[derive(Serialize)]
struct ApiError {
    kind: &'static str,
    message: String,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(kind: &'static str, message: String, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiError { kind, message }),
        }),
    )
        .into_response()
}

/// HTTP status for an engine error.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::CircularDependency { .. } | EngineError::InvalidServiceDeclaration(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::ConcurrentUpdate { .. } | EngineError::TaskConflict(_) => StatusCode::CONFLICT,
        EngineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_error(err: EngineError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(kind = err.kind(), error = %err, "request failed");
    }
    error_response(err.kind(), err.to_string(), status)
}

fn respond<T: Serialize>(result: Result<T, EngineError>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Graphs ─────────────────────────────────────────────────────

/// POST /api/v1/graphs
pub async fn install_graph(
    State(state): State<ApiState>,
    Json(graph): Json<TaskGraph>,
) -> impl IntoResponse {
    match state.engine.install(&graph).await {
        Ok(tasks) => (StatusCode::CREATED, ApiResponse::ok(tasks)).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Tasks ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub phase: Option<String>,
}

/// GET /api/v1/tasks?phase=waiting|running|finished
pub async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let phase = match query.phase.as_deref().map(str::parse::<Phase>).transpose() {
        Ok(phase) => phase,
        Err(e) => return error_response("invalid_request", e.to_string(), StatusCode::BAD_REQUEST),
    };
    respond(state.engine.list_tasks(phase))
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.engine.get_task(&id))
}

/// POST /api/v1/tasks/{id}/cancel
pub async fn cancel_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.engine.cancel(&id).await)
}

/// Mode change body. The mode is given by name (`idle`, `active`, `cancel`).
#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: String,
}

/// PUT /api/v1/tasks/{id}/mode
pub async fn set_mode(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ModeRequest>,
) -> impl IntoResponse {
    let mode = match req.mode.parse::<Mode>() {
        Ok(mode) => mode,
        Err(e) => return error_response("invalid_request", e.to_string(), StatusCode::BAD_REQUEST),
    };
    respond(state.engine.set_mode(&id, mode).await)
}

/// Response reported by a remote job.
#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub positive: bool,
    #[serde(default)]
    pub response: Value,
}

/// POST /api/v1/tasks/{id}/callback
pub async fn callback(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CallbackRequest>,
) -> impl IntoResponse {
    respond(state.engine.callback(&id, req.positive, req.response).await)
}

/// POST /api/v1/tasks/{id}/heartbeat
pub async fn heartbeat(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.engine.heartbeat(&id).await)
}

/// POST /api/v1/correlations/{cid}/cancel
pub async fn cancel_correlation(
    State(state): State<ApiState>,
    Path(cid): Path<String>,
) -> impl IntoResponse {
    respond(
        state
            .engine
            .cancel_correlation(&cid)
            .await
            .map(|cancelled| serde_json::json!({ "correlation_id": cid, "cancelled": cancelled })),
    )
}

// ── Admin ──────────────────────────────────────────────────────

/// GET /api/v1/admin/concurrency
pub async fn get_concurrency(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.engine.admission_usage())
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    pub max_concurrency: u32,
}

/// PUT /api/v1/admin/concurrency
pub async fn set_concurrency(
    State(state): State<ApiState>,
    Json(req): Json<ConcurrencyRequest>,
) -> impl IntoResponse {
    if let Err(e) = state.engine.set_max_concurrency(req.max_concurrency).await {
        return engine_error(e);
    }
    respond(state.engine.admission_usage())
}

/// GET /api/v1/admin/settings
pub async fn get_settings(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.engine.settings())
}

/// PUT /api/v1/admin/settings
pub async fn update_settings(
    State(state): State<ApiState>,
    Json(settings): Json<Settings>,
) -> impl IntoResponse {
    respond(state.engine.update_settings(settings).await)
}

/// POST /api/v1/admin/reset
pub async fn reset(State(state): State<ApiState>) -> impl IntoResponse {
    respond(
        state
            .engine
            .reset()
            .map(|removed| serde_json::json!({ "removed": removed })),
    )
}
