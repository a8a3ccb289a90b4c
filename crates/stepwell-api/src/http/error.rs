//! Application error type mapping engine errors to HTTP status codes and
//! the envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use stepwell_core::engine::dead_letter::DeadLetterError;
use stepwell_core::engine::executor::ExecutorError;
use stepwell_core::engine::graph::GraphError;
use stepwell_core::engine::launcher::LaunchError;
use stepwell_core::engine::signal::SignalError;
use stepwell_core::engine::simulate::SimulateError;
use stepwell_types::error::RepositoryError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Resource does not exist.
    NotFound(String),
    /// Request failed validation.
    Validation(String),
    /// State conflict (duplicate publish, terminal run, resolved letter).
    Conflict(String),
    /// Generic internal error.
    Internal(String),
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound => AppError::NotFound("not found".to_string()),
            RepositoryError::Conflict(msg) => AppError::Conflict(msg),
            RepositoryError::InvalidTransition(msg) => AppError::Conflict(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<GraphError> for AppError {
    fn from(e: GraphError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<SimulateError> for AppError {
    fn from(e: SimulateError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<LaunchError> for AppError {
    fn from(e: LaunchError) -> Self {
        match e {
            LaunchError::WorkflowNotFound(_) | LaunchError::RunNotFound(_) => {
                AppError::NotFound(e.to_string())
            }
            LaunchError::WorkflowDisabled(_)
            | LaunchError::AlreadyTerminal { .. } => AppError::Conflict(e.to_string()),
            LaunchError::NoTriggerNode(_) => AppError::Validation(e.to_string()),
            LaunchError::Repository(inner) => inner.into(),
            LaunchError::Executor(inner) => AppError::Internal(inner.to_string()),
        }
    }
}

impl From<SignalError> for AppError {
    fn from(e: SignalError) -> Self {
        match e {
            SignalError::Repository(inner) => inner.into(),
            SignalError::Executor(inner) => AppError::Internal(inner.to_string()),
        }
    }
}

impl From<DeadLetterError> for AppError {
    fn from(e: DeadLetterError) -> Self {
        match e {
            DeadLetterError::NotFound(_) | DeadLetterError::RunMissing(_) => {
                AppError::NotFound(e.to_string())
            }
            DeadLetterError::AlreadyResolved(_) | DeadLetterError::NotRetryable(_) => {
                AppError::Conflict(e.to_string())
            }
            DeadLetterError::Repository(inner) => inner.into(),
            DeadLetterError::Executor(inner) => AppError::Internal(inner.to_string()),
        }
    }
}

impl From<ExecutorError> for AppError {
    fn from(e: ExecutorError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
