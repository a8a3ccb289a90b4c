//! Workflow definition handlers: publish, list, enable/disable, trigger,
//! and dry-run simulation.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use stepwell_core::engine::graph::validate_graph;
use stepwell_core::engine::simulate::{SimulatedStep, simulate};
use stepwell_core::repository::engine::EngineRepository;
use stepwell_types::workflow::{
    NodeDefinition, SafetyLevel, TriggerKind, WorkflowDefinition,
};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Body for `POST /workflows`: publish a new workflow or a new version of
/// an existing one (when `id` is supplied).
#[derive(Debug, Deserialize)]
pub struct PublishWorkflowRequest {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub workspace_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger: TriggerKind,
    pub safety_level: SafetyLevel,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub nodes: Vec<NodeDefinition>,
}

fn default_enabled() -> bool {
    true
}

/// Body for `POST /workflows/{id}/trigger`.
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub payload: Value,
    /// Derived from the trigger source; omitted for ad-hoc manual kicks.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Body for `POST /workflows/{id}/simulate`.
#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    #[serde(default)]
    pub input: Value,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows - Publish a workflow definition version.
pub async fn publish_workflow(
    State(state): State<AppState>,
    Json(body): Json<PublishWorkflowRequest>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflow_id = body.id.unwrap_or_else(Uuid::now_v7);
    let next_version = match state.repo.get_latest_definition(&workflow_id).await? {
        Some(latest) => latest.version + 1,
        None => 1,
    };

    let def = WorkflowDefinition {
        id: workflow_id,
        workspace_id: body.workspace_id,
        name: body.name,
        description: body.description,
        version: next_version,
        trigger: body.trigger,
        safety_level: body.safety_level,
        enabled: body.enabled,
        nodes: body.nodes,
        published_at: Utc::now(),
    };
    validate_graph(&def)?;

    state.repo.publish_definition(&def).await?;
    tracing::info!(
        workflow_id = %def.id,
        version = def.version,
        name = def.name.as_str(),
        "workflow published"
    );

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(def, request_id, elapsed)
        .with_link("self", &format!("/api/v1/workflows/{workflow_id}"));
    Ok(Json(resp))
}

/// GET /api/v1/workflows - List the latest version of every workflow.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkflowDefinition>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let defs = state.repo.list_definitions(None).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(defs, request_id, elapsed)
        .with_link("self", "/api/v1/workflows");
    Ok(Json(resp))
}

/// GET /api/v1/workflows/{id} - Latest definition of one workflow.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = state
        .repo
        .get_latest_definition(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {id} not found")))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(def, request_id, elapsed)
        .with_link("self", &format!("/api/v1/workflows/{id}"))
        .with_link("runs", "/api/v1/runs");
    Ok(Json(resp))
}

/// POST /api/v1/workflows/{id}/enable - Accept new runs again.
pub async fn enable_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    set_enabled(state, id, true).await
}

/// POST /api/v1/workflows/{id}/disable - Stop accepting new runs.
pub async fn disable_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    set_enabled(state, id, false).await
}

async fn set_enabled(
    state: AppState,
    id: Uuid,
    enabled: bool,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.repo.set_workflow_enabled(&id, enabled).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({"id": id.to_string(), "enabled": enabled}),
        request_id,
        elapsed,
    );
    Ok(Json(resp))
}

/// POST /api/v1/workflows/{id}/trigger - Create a run (idempotent).
pub async fn trigger_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TriggerRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let idempotency_key = body
        .idempotency_key
        .unwrap_or_else(|| format!("manual:{}", Uuid::now_v7()));

    let result = state
        .launcher
        .create_run(id, body.payload, &idempotency_key)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let run_id = result.run.id;
    let payload = serde_json::json!({
        "run": result.run,
        "created": result.created,
    });
    let resp = ApiResponse::success(payload, request_id, elapsed)
        .with_link("self", &format!("/api/v1/runs/{run_id}"))
        .with_link("workflow", &format!("/api/v1/workflows/{id}"));
    Ok(Json(resp))
}

/// POST /api/v1/workflows/{id}/simulate - Dry-run the graph without
/// invoking capabilities.
pub async fn simulate_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SimulateRequest>,
) -> Result<Json<ApiResponse<Vec<SimulatedStep>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = state
        .repo
        .get_latest_definition(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {id} not found")))?;

    let steps = simulate(&def, &body.input, &state.gate)?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(steps, request_id, elapsed)
        .with_link("workflow", &format!("/api/v1/workflows/{id}"));
    Ok(Json(resp))
}
