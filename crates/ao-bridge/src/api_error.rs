//! HTTP error taxonomy for the task orchestration API.
//!
//! `ApiError` is the single surface every handler returns through. Each
//! variant maps to the status code and envelope shape from the error
//! taxonomy: `invalid-input`/`invalid-transition` as 400, `not-found` as
//! 404, `conflict` as 409, `backend-failure` as 502, `timeout` as 504,
//! `cleanup-failure`/`unexpected` as 500. `ao_agents::orchestrator::OrchestratorError`
//! converts into it via `#[from]` so handlers can just use `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ao_agents::orchestrator::OrchestratorError;
use ao_agents::runner::RunnerError;
use ao_core::secret_store::SecretStoreError;
use ao_core::task_store::TaskStoreError;
use ao_core::worktree_manager::WorktreeManagerError;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Errors surfaced by the HTTP layer. Constructed either directly by a
/// handler (invalid input, invalid id) or via `#[from]` conversion of a
/// lower-layer error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid task status: {0}")]
    InvalidTransition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no backend available")]
    NoBackendAvailable,

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("agent run timed out")]
    Timeout,

    #[error("merge conflict in: {0:?}")]
    MergeConflict(Vec<String>),

    #[error("worktree cleanup failed: {0}")]
    CleanupFailure(String),

    #[error("{0}")]
    Unexpected(String),
}

impl ApiError {
    pub fn invalid_id() -> Self {
        ApiError::Validation(vec![FieldError {
            field: "id".to_string(),
            message: "must be a UUID".to_string(),
        }])
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Transition(e) => ApiError::InvalidTransition(e.to_string()),
            OrchestratorError::NotRunning => ApiError::InvalidTransition(err.to_string()),
            OrchestratorError::AlreadyRunning => ApiError::Conflict(err.to_string()),
            OrchestratorError::Store(TaskStoreError::NotFound(id)) => {
                ApiError::NotFound(format!("task {id} not found"))
            }
            OrchestratorError::Store(e) => ApiError::Unexpected(e.to_string()),
            OrchestratorError::Worktree(WorktreeManagerError::NotFound(id)) => {
                ApiError::NotFound(format!("worktree for task {id} not found"))
            }
            OrchestratorError::Worktree(e) => ApiError::Unexpected(e.to_string()),
            OrchestratorError::Runner(RunnerError::NoBackendAvailable) => {
                ApiError::NoBackendAvailable
            }
            OrchestratorError::Runner(RunnerError::Timeout(_)) => ApiError::Timeout,
            OrchestratorError::Runner(RunnerError::AlreadyRunning(_)) => {
                ApiError::Conflict(err.to_string())
            }
            OrchestratorError::Runner(e) => ApiError::BackendFailure(e.to_string()),
            OrchestratorError::Secret(SecretStoreError::ValidationFailed(msg)) => ApiError::Validation(vec![
                FieldError { field: "value".to_string(), message: msg },
            ]),
            OrchestratorError::Secret(SecretStoreError::NotFound { kind, provider }) => {
                ApiError::NotFound(format!("no secret stored for {kind:?}/{provider:?}"))
            }
            OrchestratorError::Secret(e) => ApiError::Unexpected(e.to_string()),
            OrchestratorError::MergeConflict(files) => ApiError::MergeConflict(files),
            OrchestratorError::ConflictsRemain(files) => ApiError::MergeConflict(files),
            OrchestratorError::CleanupFailure(msg) => ApiError::CleanupFailure(msg),
            OrchestratorError::Unexpected(msg) => ApiError::Unexpected(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "Validation failed", "details": details}),
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                json!({"error": "Not found", "message": message}),
            ),
            ApiError::InvalidTransition(message) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "Invalid task status", "message": message}),
            ),
            ApiError::Conflict(message) => (
                StatusCode::CONFLICT,
                json!({"error": "Conflict", "message": message}),
            ),
            ApiError::NoBackendAvailable => (
                StatusCode::BAD_REQUEST,
                json!({"error": "No backend available", "message": "no CLI backend detected and no API key configured"}),
            ),
            ApiError::BackendFailure(message) => (
                StatusCode::BAD_GATEWAY,
                json!({"error": "Backend failure", "message": message}),
            ),
            ApiError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({"error": "Timeout", "message": "agent run exceeded its deadline"}),
            ),
            ApiError::MergeConflict(files) => (
                StatusCode::CONFLICT,
                json!({"error": "Merge conflict", "files": files}),
            ),
            ApiError::CleanupFailure(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Cleanup failure", "message": message, "recovery": "remove the worktree directory manually and retry"}),
            ),
            ApiError::Unexpected(message) => {
                tracing::error!(error = %message, "unexpected error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "Unexpected error", "message": message}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
