//! The task orchestration REST API and the `/tasks/:id/logs` event stream.
//!
//! Every handler is a thin adapter: parse and validate the request, call
//! into [`TaskOrchestrator`], translate the result (or error) into a
//! response. All task lifecycle logic lives in `ao-agents::orchestrator`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use ao_agents::orchestrator::{StreamOpen, TaskOrchestrator, TaskPatch};
use ao_core::config::Config;
use ao_core::event_hub::EventRecord;
use ao_core::types::{
    ChatEvent, CliBackendKind, ForgeConnectionMethod, SecretKind, SecretMetadata, SecretProvider, Task, TaskStatus,
};

use crate::api_error::{ApiError, FieldError};
use crate::auth::AuthLayer;

// ---------------------------------------------------------------------------
// AppState / router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<TaskOrchestrator>,
    config: Arc<Config>,
}

/// Build the full HTTP surface: task CRUD and lifecycle actions, the SSE
/// log/chat stream, and an unauthenticated `/healthz`.
pub fn router(orchestrator: Arc<TaskOrchestrator>, config: Arc<Config>) -> Router {
    let state = AppState { orchestrator, config: config.clone() };

    let authenticated = Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task).patch(update_task).delete(delete_task))
        .route("/tasks/{id}/generate-spec", post(generate_spec))
        .route("/tasks/{id}/regenerate-spec", post(regenerate_spec))
        .route("/tasks/{id}/spec", patch(edit_spec))
        .route("/tasks/{id}/approve-spec", post(approve_spec))
        .route("/tasks/{id}/approve-plan", post(approve_plan))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/execute", post(start_task))
        .route("/tasks/{id}/feedback", post(feedback))
        .route("/tasks/{id}/extend", post(extend_timeout))
        .route("/tasks/{id}/cancel", post(cancel))
        .route("/tasks/{id}/approve", post(approve_pr))
        .route("/tasks/{id}/request-changes", post(request_changes))
        .route("/tasks/{id}/pr-merged", post(pr_merged))
        .route("/tasks/{id}/pr-closed", post(pr_closed))
        .route("/tasks/{id}/cleanup-worktree", post(cleanup_worktree))
        .route("/tasks/{id}/open-editor", post(open_editor))
        .route("/tasks/{id}/resolve-conflicts", post(resolve_conflicts))
        .route("/tasks/{id}/changes", get(changes))
        .route("/tasks/{id}/logs", get(logs_stream))
        .route("/tasks/{id}/pr-comments", get(pr_comments))
        .route("/secrets", post(save_secret))
        .route("/secrets/{kind}/{provider}", get(secret_status).delete(delete_secret))
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))
        .layer(AuthLayer::new(config.auth_token.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    Router::new()
        .route("/healthz", get(healthz))
        .merge(authenticated)
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// id parsing
// ---------------------------------------------------------------------------

/// True for `^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$` —
/// the opaque-id pattern, lowercase hyphenated only. `Uuid::parse_str` alone
/// is too permissive: it also accepts uppercase hex, braced, and URN forms.
fn is_opaque_id(raw: &str) -> bool {
    let groups: [usize; 5] = [8, 4, 4, 4, 12];
    let mut parts = raw.split('-');
    for len in groups {
        match parts.next() {
            Some(part) if part.len() == len && part.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) => {}
            _ => return false,
        }
    }
    parts.next().is_none()
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    if !is_opaque_id(raw) {
        return Err(ApiError::invalid_id());
    }
    Uuid::parse_str(raw).map_err(|_| ApiError::invalid_id())
}

// ---------------------------------------------------------------------------
// POST /tasks, GET /tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    description: String,
    repo_url: String,
    target_branch: Option<String>,
    context_files: Option<Vec<String>>,
    build_command: Option<String>,
    repository_id: Option<Uuid>,
    user_input: Option<String>,
    #[serde(alias = "agent_type")]
    backend: Option<CliBackendKind>,
    agent_model: Option<String>,
}

impl CreateTaskRequest {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.title.trim().is_empty() {
            errors.push(FieldError { field: "title".into(), message: "must not be empty".into() });
        }
        if self.description.trim().is_empty() {
            errors.push(FieldError { field: "description".into(), message: "must not be empty".into() });
        }
        if self.repo_url.trim().is_empty() {
            errors.push(FieldError { field: "repo_url".into(), message: "must not be empty".into() });
        }
        errors
    }

    fn into_task(self) -> Task {
        let mut task = Task::new(self.title, self.description, self.repo_url);
        if let Some(v) = self.user_input {
            task.user_input = v;
        }
        if let Some(v) = self.target_branch {
            task.target_branch = v;
        }
        if let Some(v) = self.context_files {
            task.context_files = v;
        }
        task.build_command = self.build_command;
        task.repository_id = self.repository_id;
        if let Some(v) = self.backend {
            task.backend = v;
        }
        task.agent_model = self.agent_model;
        task
    }
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Response, ApiError> {
    let errors = body.validate();
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    let task = state.orchestrator.create_task(body.into_task()).await?;
    Ok((axum::http::StatusCode::CREATED, Json(task)).into_response())
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<TaskStatus>,
    repository_id: Option<Uuid>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state.orchestrator.list_tasks(query.status, query.repository_id).await?;
    Ok(Json(tasks))
}

// ---------------------------------------------------------------------------
// GET/PATCH/DELETE /tasks/:id
// ---------------------------------------------------------------------------

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get_task(id).await?))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.update_task(id, patch).await?))
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    state.orchestrator.delete(id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// spec lifecycle
// ---------------------------------------------------------------------------

async fn generate_spec(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let task = state.orchestrator.generate_spec(id).await?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(task)).into_response())
}

async fn regenerate_spec(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let task = state.orchestrator.regenerate_spec(id).await?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(task)).into_response())
}

#[derive(Debug, Deserialize)]
struct EditSpecRequest {
    spec: String,
}

async fn edit_spec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EditSpecRequest>,
) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.edit_spec(id, body.spec).await?))
}

async fn approve_spec(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.approve_spec(id).await?))
}

async fn approve_plan(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.approve_plan(id).await?))
}

async fn start_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let task = state.orchestrator.start(id).await?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(task)).into_response())
}

// ---------------------------------------------------------------------------
// feedback / timeout / cancel
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    message: String,
}

async fn feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.feedback(id, body.message).await?))
}

async fn extend_timeout(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    state.orchestrator.extend_timeout(id).await?;
    Ok(Json(json!({"new_timeout": state.config.agent_timeout_extend_secs})))
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.cancel(id).await?))
}

// ---------------------------------------------------------------------------
// PR lifecycle
// ---------------------------------------------------------------------------

async fn approve_pr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    let pr_url = state.orchestrator.approve_pr(id).await?;
    Ok(Json(json!({"pr_url": pr_url})))
}

#[derive(Debug, Deserialize)]
struct RequestChangesRequest {
    feedback: String,
}

async fn request_changes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RequestChangesRequest>,
) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.request_changes(id, body.feedback).await?))
}

async fn pr_merged(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.pr_merged(id).await?))
}

async fn pr_closed(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.pr_closed(id).await?))
}

async fn resolve_conflicts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    let pr_url = state.orchestrator.resolve_conflicts(id).await?;
    Ok(Json(json!({"pr_url": pr_url})))
}

// ---------------------------------------------------------------------------
// worktree / deletion / diff
// ---------------------------------------------------------------------------

async fn cleanup_worktree(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.cleanup_worktree(id).await?))
}

async fn changes(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let diff = state.orchestrator.changes(id).await?;
    Ok(Json(diff).into_response())
}

/// `open-editor` and `pr-comments` depend on an external editor/forge
/// integration outside this crate's scope. These handlers validate the
/// task exists and is in the right state, then acknowledge without
/// shelling out or calling a forge API.
async fn open_editor(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let task = state.orchestrator.get_task(id).await?;
    if task.status != TaskStatus::MergeConflicts {
        return Err(ApiError::InvalidTransition(format!(
            "open-editor requires merge_conflicts, task is {:?}",
            task.status
        )));
    }
    Ok(Json(json!({"opened": true})).into_response())
}

async fn pr_comments(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let task = state.orchestrator.get_task(id).await?;
    if task.pr_url.is_none() {
        return Err(ApiError::InvalidTransition("task has no open pull request".to_string()));
    }
    Ok(Json(json!({"comments": [], "totalCount": 0})).into_response())
}

// ---------------------------------------------------------------------------
// secret storage
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SaveSecretRequest {
    kind: SecretKind,
    provider: SecretProvider,
    value: String,
    label: Option<String>,
    avatar_url: Option<String>,
    connection_method: Option<ForgeConnectionMethod>,
    #[serde(default = "default_true")]
    reject_invalid: bool,
}

async fn save_secret(
    State(state): State<AppState>,
    Json(body): Json<SaveSecretRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.value.trim().is_empty() {
        return Err(ApiError::Validation(vec![FieldError {
            field: "value".to_string(),
            message: "must not be empty".to_string(),
        }]));
    }
    let metadata = SecretMetadata {
        label: body.label,
        avatar_url: body.avatar_url,
        connection_method: body.connection_method,
    };
    let outcome = state
        .orchestrator
        .save_secret(body.kind, body.provider, body.value, metadata, body.reject_invalid)
        .await?;
    Ok(Json(json!({"valid": outcome.valid, "detail": outcome.detail})))
}

async fn secret_status(
    State(state): State<AppState>,
    Path((kind, provider)): Path<(SecretKind, SecretProvider)>,
) -> Json<serde_json::Value> {
    let status = state.orchestrator.secret_status(kind, provider);
    Json(json!({
        "kind": status.kind,
        "provider": status.provider,
        "present": status.present,
        "metadata": status.metadata,
        "updated_at": status.updated_at,
    }))
}

async fn delete_secret(
    State(state): State<AppState>,
    Path((kind, provider)): Path<(SecretKind, SecretProvider)>,
) -> Result<Response, ApiError> {
    state.orchestrator.delete_secret(kind, provider)?;
    Ok(axum::http::StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// operator-facing metrics export
// ---------------------------------------------------------------------------

async fn get_metrics_prometheus() -> impl IntoResponse {
    let body = ao_telemetry::metrics::global_metrics().export_prometheus();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn get_metrics_json() -> impl IntoResponse {
    Json(ao_telemetry::metrics::global_metrics().export_json())
}

// ---------------------------------------------------------------------------
// GET /tasks/:id/logs — SSE event stream
// ---------------------------------------------------------------------------

fn sse_event(name: &'static str, data: impl serde::Serialize) -> Event {
    Event::default().event(name).data(serde_json::to_string(&data).unwrap_or_default())
}

fn replay_events(open: &StreamOpen, task_id: Uuid) -> Vec<Event> {
    let mut events = Vec::with_capacity(open.logs.len() + open.chat.len() + 2);

    for log in &open.logs {
        events.push(sse_event(
            "log",
            json!({"task_id": log.task_id, "level": log.level, "message": log.message, "at": log.created_at}),
        ));
    }

    for chat in &open.chat {
        match chat {
            ChatEvent::Message { task_id, role, text, created_at, .. } => {
                events.push(sse_event(
                    "chat_message",
                    json!({"task_id": task_id, "role": role, "text": text, "at": created_at}),
                ));
            }
            ChatEvent::ToolActivity { task_id, tool_name, summary, created_at, .. } => {
                events.push(sse_event(
                    "tool_activity",
                    json!({"task_id": task_id, "tool_name": tool_name, "summary": summary, "at": created_at}),
                ));
            }
        }
    }

    events.push(sse_event("status", json!({"task_id": task_id, "status": open.status})));

    if let Some(immediate) = &open.immediate {
        events.push(sse_event(immediate.event_name(), immediate));
    }

    events
}

/// Whether `open.immediate` (the last event [`replay_events`] appends, if
/// any) is a `complete`/`error` event that should end the connection once
/// delivered, per the terminal-task streaming contract.
fn replay_ends_stream(open: &StreamOpen) -> bool {
    open.immediate.as_ref().is_some_and(is_terminal_event)
}

struct LogStreamState {
    queued: std::collections::VecDeque<Event>,
    live: tokio::sync::mpsc::Receiver<EventRecord>,
    heartbeat: tokio::time::Interval,
    done: bool,
    /// Set when the replayed backlog's final event is itself terminal
    /// (`complete`/`error`), so the stream ends once it's been delivered
    /// instead of falling through to live/heartbeat polling.
    ends_after_replay: bool,
}

fn is_terminal_event(record: &EventRecord) -> bool {
    matches!(record, EventRecord::Complete { .. } | EventRecord::Error { .. })
}

async fn logs_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_id(&id)?;
    let open = state.orchestrator.open_stream(id).await?;
    let ends_after_replay = replay_ends_stream(&open);
    let queued: std::collections::VecDeque<Event> = replay_events(&open, id).into();

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(state.config.event_heartbeat_secs));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let stream_state = LogStreamState {
        queued,
        live: open.live,
        heartbeat,
        done: false,
        ends_after_replay,
    };

    let stream = futures_util::stream::unfold(stream_state, |mut s| async move {
        if let Some(event) = s.queued.pop_front() {
            if s.queued.is_empty() && s.ends_after_replay {
                s.done = true;
            }
            return Some((Ok(event), s));
        }
        if s.done {
            return None;
        }
        tokio::select! {
            received = s.live.recv() => match received {
                Some(record) => {
                    if is_terminal_event(&record) {
                        s.done = true;
                    }
                    let event = sse_event(record.event_name(), &record);
                    Some((Ok(event), s))
                }
                None => None,
            },
            _ = s.heartbeat.tick() => {
                Some((Ok(Event::default().comment("keep-alive")), s))
            }
        }
    });

    Ok(Sse::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_agents::runner::AgentRunner;
    use ao_core::event_hub::EventHub;
    use ao_core::secret_store::SecretStore;
    use ao_core::task_store::TaskStore;
    use ao_core::worktree_manager::WorktreeManager;
    use ao_harness::process_supervisor::ProcessSupervisor;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let config = Arc::new(Config { auth_token: None, ..Config::default() });
        build_app(config).await
    }

    async fn build_app_with_orchestrator(config: Arc<Config>) -> (Router, Arc<TaskOrchestrator>) {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let secrets_dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(SecretStore::open(secrets_dir.path()).unwrap());
        let worktrees_base = tempfile::tempdir().unwrap();
        let worktrees = Arc::new(WorktreeManager::new(
            worktrees_base.path().join("repos"),
            worktrees_base.path().join("worktrees"),
        ));
        let runner = Arc::new(AgentRunner::new(
            ProcessSupervisor::new(),
            config.event_heartbeat_secs,
            config.agent_timeout_secs,
        ));
        let events = Arc::new(EventHub::new());
        let orchestrator = Arc::new(TaskOrchestrator::new(store, worktrees, runner, events, secrets, config.clone()));
        (router(orchestrator.clone(), config), orchestrator)
    }

    async fn build_app(config: Arc<Config>) -> Router {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let secrets_dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(SecretStore::open(secrets_dir.path()).unwrap());
        let worktrees_base = tempfile::tempdir().unwrap();
        let worktrees = Arc::new(WorktreeManager::new(
            worktrees_base.path().join("repos"),
            worktrees_base.path().join("worktrees"),
        ));
        let runner = Arc::new(AgentRunner::new(
            ProcessSupervisor::new(),
            config.event_heartbeat_secs,
            config.agent_timeout_secs,
        ));
        let events = Arc::new(EventHub::new());
        let orchestrator = Arc::new(TaskOrchestrator::new(store, worktrees, runner, events, secrets, config.clone()));
        router(orchestrator, config)
    }

    #[test]
    fn is_terminal_event_flags_complete_and_error_only() {
        let task_id = Uuid::new_v4();
        assert!(is_terminal_event(&EventRecord::Complete { task_id, pr_url: "https://example/pr/1".into() }));
        assert!(is_terminal_event(&EventRecord::Error { task_id, message: "boom".into() }));
        assert!(!is_terminal_event(&EventRecord::Log {
            task_id,
            level: ao_core::types::LogLevel::Info,
            message: "hi".into(),
            at: chrono::Utc::now(),
        }));
    }

    #[test]
    fn parse_id_accepts_lowercase_hyphenated_uuid() {
        assert!(parse_id("aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee").is_ok());
    }

    #[test]
    fn parse_id_rejects_uppercase() {
        assert!(parse_id("AAAAAAAA-BBBB-4CCC-8DDD-EEEEEEEEEEEE").is_err());
    }

    #[test]
    fn parse_id_rejects_simple_form_without_hyphens() {
        assert!(parse_id("aaaaaaaabbbb4ccc8ddeeeeeeeeeeee0").is_err());
    }

    #[test]
    fn parse_id_rejects_braced_form() {
        assert!(parse_id("{aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee}").is_err());
    }

    #[tokio::test]
    async fn healthz_requires_no_auth() {
        let app = test_app().await;
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_then_get_task() {
        let app = test_app().await;
        let body = json!({"title": "Add README", "description": "write one", "repo_url": "https://github.com/example/repo.git"});
        let req = Request::builder()
            .method("POST")
            .uri("/tasks")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let task: Task = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(task.status, TaskStatus::Draft);

        let req = Request::builder().uri(format!("/tasks/{}", task.id)).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_task_rejects_blank_title() {
        let app = test_app().await;
        let body = json!({"title": "", "description": "write one", "repo_url": "https://github.com/example/repo.git"});
        let req = Request::builder()
            .method("POST")
            .uri("/tasks")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["error"], "Validation failed");
    }

    #[tokio::test]
    async fn get_task_with_malformed_id_is_400() {
        let app = test_app().await;
        let req = Request::builder().uri("/tasks/not-a-uuid").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_unknown_task_is_404() {
        let app = test_app().await;
        let req = Request::builder()
            .uri(format!("/tasks/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_on_draft_task_is_rejected_as_invalid_transition() {
        let app = test_app().await;
        let body = json!({"title": "Add README", "description": "write one", "repo_url": "https://github.com/example/repo.git"});
        let req = Request::builder()
            .method("POST")
            .uri("/tasks")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let task: Task = serde_json::from_slice(&bytes).unwrap();

        let req = Request::builder()
            .method("POST")
            .uri(format!("/tasks/{}/cancel", task.id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logs_stream_closes_after_terminal_event_for_done_task() {
        let config = Arc::new(Config { auth_token: None, event_heartbeat_secs: 3600, ..Config::default() });
        let (app, orchestrator) = build_app_with_orchestrator(config).await;

        let mut task = Task::new("Add README", "write one", "https://github.com/example/repo.git");
        task.status = TaskStatus::Done;
        task.pr_url = Some("https://example.com/pr/1".to_string());
        let task = orchestrator.create_task(task).await.unwrap();

        let req = Request::builder().uri(format!("/tasks/{}/logs", task.id)).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // A heartbeat interval of an hour means the stream can only end this
        // fast if it actually closes after the replayed `complete` event,
        // instead of idling on the next heartbeat tick.
        let bytes = tokio::time::timeout(std::time::Duration::from_secs(5), axum::body::to_bytes(resp.into_body(), usize::MAX))
            .await
            .expect("stream should close instead of hanging on heartbeats")
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("complete"), "body was: {body}");
    }

    #[tokio::test]
    async fn auth_layer_rejects_missing_key_but_healthz_stays_open() {
        let config = Arc::new(Config { auth_token: Some("secret".into()), ..Config::default() });
        let app = build_app(config).await;

        let req = Request::builder().uri("/tasks").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
