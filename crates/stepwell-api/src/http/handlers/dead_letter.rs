//! Dead-letter queue handlers: inspect, resolve, replay.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use stepwell_types::run::{DeadLetter, ResolutionAction};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Query parameters for listing dead letters.
#[derive(Debug, Deserialize)]
pub struct ListDeadLettersQuery {
    /// Maximum number of entries to return (default 50).
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Body for `POST /dead-letters/{id}/resolve`.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// "dismissed" or "resolved" ("retried" is set by the retry endpoint).
    pub action: ResolutionAction,
    pub resolved_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Body for `POST /dead-letters/{id}/retry`.
#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub resolved_by: String,
}

/// GET /api/v1/dead-letters - Unresolved dead letters, oldest first.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListDeadLettersQuery>,
) -> Result<Json<ApiResponse<Vec<DeadLetter>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let letters = state.dead_letters.list_unresolved(query.limit).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(letters, request_id, elapsed)
        .with_link("self", "/api/v1/dead-letters");
    Ok(Json(resp))
}

/// GET /api/v1/dead-letters/{id} - One dead letter.
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<DeadLetter>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let letter = state.dead_letters.get(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let run_id = letter.run_id;
    let resp = ApiResponse::success(letter, request_id, elapsed)
        .with_link("self", &format!("/api/v1/dead-letters/{id}"))
        .with_link("run", &format!("/api/v1/runs/{run_id}"));
    Ok(Json(resp))
}

/// POST /api/v1/dead-letters/{id}/resolve - Attach a resolution.
pub async fn resolve_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state
        .dead_letters
        .resolve(id, body.action, &body.resolved_by, body.notes.as_deref())
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({"id": id.to_string(), "resolved": true}),
        request_id,
        elapsed,
    );
    Ok(Json(resp))
}

/// POST /api/v1/dead-letters/{id}/retry - Replay as a new run.
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RetryRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let (run, _outcome) = state.dead_letters.retry(id, &body.resolved_by).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let run_id = run.id;
    let resp = ApiResponse::success(
        serde_json::json!({
            "dead_letter_id": id.to_string(),
            "replay_run": run,
        }),
        request_id,
        elapsed,
    )
    .with_link("run", &format!("/api/v1/runs/{run_id}"));
    Ok(Json(resp))
}
