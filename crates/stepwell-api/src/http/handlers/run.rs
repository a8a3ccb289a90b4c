//! Run monitoring and management handlers: list, detail, cancel, signal.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use stepwell_core::engine::signal::SignalOutcome;
use stepwell_core::repository::engine::EngineRepository;
use stepwell_types::run::{RunStatus, WorkflowRun};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query / request bodies
// ---------------------------------------------------------------------------

/// Query parameters for listing runs.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Filter by status (e.g. "awaiting_signal").
    #[serde(default)]
    pub status: Option<String>,
    /// Maximum number of runs to return (default 20).
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

/// Body for `POST /runs/{id}/cancel`.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    #[serde(default = "default_operator")]
    pub cancelled_by: String,
}

fn default_operator() -> String {
    "operator".to_string()
}

/// Body for `POST /runs/{id}/signal`.
#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub signal_type: String,
    #[serde(default)]
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/v1/runs - List runs, optionally filtered by status.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowRun>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let status = query
        .status
        .as_deref()
        .map(|s| {
            RunStatus::parse(s)
                .ok_or_else(|| AppError::Validation(format!("unknown status '{s}'")))
        })
        .transpose()?;

    let runs = state.repo.list_runs(status, query.limit).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(runs, request_id, elapsed)
        .with_link("self", "/api/v1/runs");
    Ok(Json(resp))
}

/// GET /api/v1/runs/{id} - Run detail including checkpoint and error.
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let run = state
        .repo
        .get_run(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("run {id} not found")))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let workflow_id = run.workflow_id;
    let resp = ApiResponse::success(run, request_id, elapsed)
        .with_link("self", &format!("/api/v1/runs/{id}"))
        .with_link("workflow", &format!("/api/v1/workflows/{workflow_id}"));
    Ok(Json(resp))
}

/// POST /api/v1/runs/{id}/cancel - Operator cancellation.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let run = state
        .launcher
        .cancel_run(id, &body.reason, &body.cancelled_by)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(run, request_id, elapsed)
        .with_link("self", &format!("/api/v1/runs/{id}"));
    Ok(Json(resp))
}

/// POST /api/v1/runs/{id}/signal - Deliver an external signal.
///
/// Succeeds whether or not the run was waiting; the body reports which.
pub async fn send_signal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SignalRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let outcome = state
        .signals
        .deliver(id, &body.signal_type, body.payload)
        .await?;

    let delivered = matches!(outcome, SignalOutcome::Delivered { .. });
    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({
            "run_id": id.to_string(),
            "signal_type": body.signal_type,
            "delivered": delivered,
        }),
        request_id,
        elapsed,
    )
    .with_link("run", &format!("/api/v1/runs/{id}"));
    Ok(Json(resp))
}
