//! HTTP API: cached projections and on-demand refreshes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use rozklad_scheduler::Scheduler;
use rozklad_sync::{Orchestrator, Projections, RefreshOp, RefreshOutcome, SyncError};

/// Shared state for the HTTP API.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub projections: Projections,
    pub scheduler: Scheduler,
}

/// Errors a read handler can answer with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] SyncError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "message": message }))).into_response()
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
            }
            ApiError::Internal(e) => {
                error!(error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v0/faculties", get(faculties))
        .route("/v0/groups/{group_id}", get(group_timetable))
        .route("/v0/groups", post(refresh_group))
        .route("/v0/teachers", post(refresh_teachers))
        .route("/v0/refresh/{scope}", post(refresh_scope))
        .route("/v0/tasks", get(tasks))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wrap an already serialized projection as `{"data": ...}`.
fn data_response(payload: String) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        format!("{{\"data\":{}}}", payload),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn faculties(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let payload = state.projections.faculties_json().await?;
    Ok(data_response(payload))
}

async fn group_timetable(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
) -> Result<Response, ApiError> {
    match state.projections.timetable_json(group_id).await? {
        Some(payload) => Ok(data_response(payload)),
        None => Err(ApiError::NotFound("Group not found")),
    }
}

async fn tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "data": state.scheduler.list_tasks().await }))
}

#[derive(Deserialize)]
struct GroupQuery {
    group_id: i64,
}

async fn refresh_group(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GroupQuery>,
) -> Response {
    let op = RefreshOp::GroupLessons(query.group_id);
    refresh_response(op, state.orchestrator.refresh(op).await)
}

async fn refresh_teachers(State(state): State<Arc<AppState>>) -> Response {
    let op = RefreshOp::Teachers;
    refresh_response(op, state.orchestrator.refresh(op).await)
}

async fn refresh_scope(
    State(state): State<Arc<AppState>>,
    Path(scope): Path<String>,
) -> Result<Response, ApiError> {
    let op: RefreshOp = scope.parse().map_err(ApiError::BadRequest)?;
    Ok(refresh_response(op, state.orchestrator.refresh(op).await))
}

fn refresh_response(op: RefreshOp, outcome: RefreshOutcome) -> Response {
    match outcome {
        RefreshOutcome::Updated { rows_written } => {
            info!(op = %op, rows_written, "on-demand refresh served");
            Json(json!({
                "message": format!("{} updated", op),
                "rows_written": rows_written,
            }))
            .into_response()
        }
        RefreshOutcome::NotFound => ApiError::NotFound("Group not found").into_response(),
        RefreshOutcome::AlreadyInProgress { retry_after } => {
            let secs = retry_after.as_secs().max(1);
            let mut response = (
                StatusCode::CONFLICT,
                Json(json!({
                    "message": format!("refresh of {} already in progress", op),
                    "retry_after_secs": secs,
                })),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            response
        }
        RefreshOutcome::UpstreamError { message } => {
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": message }))).into_response()
        }
    }
}
