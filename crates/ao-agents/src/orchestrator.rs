//! TaskOrchestrator: the facade `ao-bridge`'s HTTP handlers call into for
//! every task lifecycle action. It composes `ao-core`'s storage, worktree,
//! and secret layers with this crate's backend runner, translating each
//! action into a status transition, a persisted write, and a published
//! event — and, where the action starts an agent run, a background task
//! that drives the run to completion.

use std::sync::Arc;
use std::time::Duration;

use ao_core::config::Config;
use ao_core::event_hub::{EventHub, EventRecord};
use ao_core::secret_store::{SecretStore, SecretStoreError};
use ao_core::task_store::{TaskStore, TaskStoreError};
use ao_core::types::{
    ChatEvent, ChatRole, CliBackendKind, DiffSummary, HostedProvider, LogEntry, LogLevel,
    SecretKind, SecretProvider, Task, TaskAction, TaskStatus, TransitionError, WorktreeInfo,
};
use ao_core::worktree_manager::{MergeOutcome, PushResult, WorktreeManager, WorktreeManagerError};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::backend::AgentEvent;
use crate::prompt::{execute_prompt, plan_prompt, resume_prompt, spec_generation_prompt};
use crate::runner::{AgentRunner, HostedCredential, RunMode, RunnerError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("task has no agent run in progress")]
    NotRunning,
    #[error("task already has a run in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    #[error(transparent)]
    Worktree(#[from] WorktreeManagerError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Secret(#[from] SecretStoreError),
    #[error("merge conflict in: {0:?}")]
    MergeConflict(Vec<String>),
    #[error("unresolved conflict markers remain in: {0:?}")]
    ConflictsRemain(Vec<String>),
    #[error("worktree cleanup failed: {0}")]
    CleanupFailure(String),
    #[error("{0}")]
    Unexpected(String),
}

// ---------------------------------------------------------------------------
// ForgeClient: the opaque PR-creation capability
// ---------------------------------------------------------------------------

/// Capability seam for creating a pull/merge request once a branch has been
/// pushed. A real implementation would call the GitHub/GitLab REST API with
/// a stored forge token; that HTTP client is outside this crate's scope, so
/// the default implementation below only constructs the forge's compare
/// URL after a successful push, which is enough to drive the lifecycle
/// through `pr_created` in tests and local use.
#[async_trait::async_trait]
pub trait ForgeClient: Send + Sync {
    async fn create_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        target_branch: &str,
        title: &str,
        body: &str,
        token: Option<&str>,
    ) -> Result<String, OrchestratorError>;
}

pub struct CompareUrlForgeClient;

#[async_trait::async_trait]
impl ForgeClient for CompareUrlForgeClient {
    async fn create_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        target_branch: &str,
        _title: &str,
        _body: &str,
        _token: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        Ok(build_compare_url(repo_url, target_branch, branch))
    }
}

fn build_compare_url(repo_url: &str, target_branch: &str, branch: &str) -> String {
    if let Some(rest) = repo_url.strip_prefix("https://github.com/") {
        let repo = rest.trim_end_matches(".git");
        return format!("https://github.com/{repo}/compare/{target_branch}...{branch}?expand=1");
    }
    if let Some(rest) = repo_url.strip_prefix("https://gitlab.com/") {
        let repo = rest.trim_end_matches(".git");
        return format!(
            "https://gitlab.com/{repo}/-/merge_requests/new?merge_request%5Bsource_branch%5D={branch}&merge_request%5Btarget_branch%5D={target_branch}"
        );
    }
    format!("{repo_url}/compare/{target_branch}...{branch}")
}

// ---------------------------------------------------------------------------
// TaskPatch
// ---------------------------------------------------------------------------

/// Partial update applied by `PATCH /tasks/:id`; only present fields change.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub context_files: Option<Vec<String>>,
    pub build_command: Option<String>,
    pub backend: Option<CliBackendKind>,
    pub agent_model: Option<String>,
    pub target_branch: Option<String>,
    pub repository_id: Option<Uuid>,
}

impl TaskPatch {
    fn apply(self, task: &mut Task) {
        if let Some(v) = self.title {
            task.title = v;
        }
        if let Some(v) = self.description {
            task.description = v;
        }
        if let Some(v) = self.context_files {
            task.context_files = v;
        }
        if let Some(v) = self.build_command {
            task.build_command = Some(v);
        }
        if let Some(v) = self.backend {
            task.backend = v;
        }
        if let Some(v) = self.agent_model {
            task.agent_model = Some(v);
        }
        if let Some(v) = self.target_branch {
            task.target_branch = v;
        }
        if let Some(v) = self.repository_id {
            task.repository_id = Some(v);
        }
    }
}

// ---------------------------------------------------------------------------
// StreamOpen
// ---------------------------------------------------------------------------

/// Everything a freshly connecting event-stream client needs: the persisted
/// backlog, an optional synthetic event for a task that's already settled,
/// and a live receiver for whatever is published from this point on.
pub struct StreamOpen {
    pub logs: Vec<LogEntry>,
    pub chat: Vec<ChatEvent>,
    pub status: TaskStatus,
    pub immediate: Option<EventRecord>,
    pub live: tokio::sync::mpsc::Receiver<EventRecord>,
}

// ---------------------------------------------------------------------------
// TaskOrchestrator
// ---------------------------------------------------------------------------

pub struct TaskOrchestrator {
    store: Arc<TaskStore>,
    worktrees: Arc<WorktreeManager>,
    runner: Arc<AgentRunner>,
    events: Arc<EventHub>,
    secrets: Arc<SecretStore>,
    forge: Arc<dyn ForgeClient>,
    config: Arc<Config>,
    deadlines: DashMap<Uuid, Arc<AsyncMutex<Instant>>>,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<TaskStore>,
        worktrees: Arc<WorktreeManager>,
        runner: Arc<AgentRunner>,
        events: Arc<EventHub>,
        secrets: Arc<SecretStore>,
        config: Arc<Config>,
    ) -> Self {
        Self::with_forge_client(store, worktrees, runner, events, secrets, config, Arc::new(CompareUrlForgeClient))
    }

    pub fn with_forge_client(
        store: Arc<TaskStore>,
        worktrees: Arc<WorktreeManager>,
        runner: Arc<AgentRunner>,
        events: Arc<EventHub>,
        secrets: Arc<SecretStore>,
        config: Arc<Config>,
        forge: Arc<dyn ForgeClient>,
    ) -> Self {
        Self {
            store,
            worktrees,
            runner,
            events,
            secrets,
            forge,
            config,
            deadlines: DashMap::new(),
        }
    }

    // -- CRUD -----------------------------------------------------------

    pub async fn create_task(&self, mut task: Task) -> Result<Task, OrchestratorError> {
        task.touch();
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task.id, task.status);
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, OrchestratorError> {
        Ok(self.store.require_task(id).await?)
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        repository_id: Option<Uuid>,
    ) -> Result<Vec<Task>, OrchestratorError> {
        let tasks = self.store.list_tasks(status).await?;
        Ok(match repository_id {
            Some(id) => tasks.into_iter().filter(|t| t.repository_id == Some(id)).collect(),
            None => tasks,
        })
    }

    pub async fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(id).await?;
        patch.apply(&mut task);
        task.touch();
        self.store.upsert_task(&task).await?;
        Ok(task)
    }

    pub async fn changes(&self, task_id: Uuid) -> Result<DiffSummary, OrchestratorError> {
        let task = self.store.require_task(task_id).await?;
        if let Ok(info) = self.worktrees.create_for_task(&task) {
            if let Ok(diff) = self.worktrees.diff_for_task(&info, &task.target_branch) {
                return Ok(diff);
            }
        }
        task.diff_snapshot
            .clone()
            .ok_or_else(|| OrchestratorError::Unexpected("no diff available for this task".into()))
    }

    // -- spec generation --------------------------------------------------

    pub async fn generate_spec(self: Arc<Self>, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::GenerateSpec)?;
        task.set_status(TaskStatus::Refining);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);
        self.spawn_spec_generation(task);
        self.store.require_task(task_id).await.map_err(OrchestratorError::from)
    }

    pub async fn regenerate_spec(self: Arc<Self>, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::RegenerateSpec)?;
        task.set_status(TaskStatus::Refining);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);
        self.spawn_spec_generation(task);
        self.store.require_task(task_id).await.map_err(OrchestratorError::from)
    }

    fn spawn_spec_generation(self: &Arc<Self>, task: Task) {
        let this = Arc::clone(self);
        let prompt = spec_generation_prompt(&task);
        let hosted = self.hosted_credential(&task);
        let task_id = task.id;
        tokio::spawn(async move {
            let worktree_dir = std::env::temp_dir().display().to_string();
            let outcome = this
                .drive_run(task_id, RunMode::SpecGeneration, prompt, worktree_dir, hosted)
                .await;
            this.finish_spec_generation(task_id, outcome).await;
        });
    }

    async fn finish_spec_generation(&self, task_id: Uuid, outcome: Result<String, OrchestratorError>) {
        let Ok(mut task) = self.store.require_task(task_id).await else {
            return;
        };
        match outcome {
            Ok(text) => {
                task.generated_spec = Some(text);
                task.set_status(TaskStatus::PendingApproval);
            }
            Err(err) => {
                task.error = Some(err.to_string());
                task.set_status(TaskStatus::Failed);
                self.events.publish_error(task_id, err.to_string());
            }
        }
        let _ = self.store.upsert_task(&task).await;
        self.events.publish_status(task_id, task.status);
    }

    pub async fn edit_spec(&self, task_id: Uuid, spec: String) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::EditSpec)?;
        task.generated_spec = Some(spec);
        task.was_edited = true;
        task.touch();
        self.store.upsert_task(&task).await?;
        Ok(task)
    }

    pub async fn approve_spec(self: Arc<Self>, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::ApproveSpec)?;
        task.final_specification = task.generated_spec.clone();
        task.set_status(TaskStatus::Approved);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);
        self.start(task_id).await
    }

    // -- planning / coding --------------------------------------------------

    pub async fn start(self: Arc<Self>, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::Start)?;
        if self.runner.locks().try_acquire(task_id).is_none() {
            return Err(OrchestratorError::AlreadyRunning);
        }

        let info = self.worktrees.create_for_task(&task)?;
        task.branch_name = Some(info.branch.clone());
        task.set_status(TaskStatus::Planning);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);

        let this = Arc::clone(&self);
        let prompt = plan_prompt(&task);
        let hosted = self.hosted_credential(&task);
        let worktree_dir = info.path.clone();
        tokio::spawn(async move {
            let outcome = this
                .drive_run(task_id, RunMode::Execute, prompt, worktree_dir, hosted)
                .await;
            this.finish_planning(task_id, outcome).await;
        });

        self.store.require_task(task_id).await.map_err(OrchestratorError::from)
    }

    async fn finish_planning(&self, task_id: Uuid, outcome: Result<String, OrchestratorError>) {
        let Ok(mut task) = self.store.require_task(task_id).await else {
            return;
        };
        match outcome {
            Ok(plan_text) => {
                task.plan = Some(plan_text);
                task.set_status(TaskStatus::PlanReview);
            }
            Err(err) => {
                task.error = Some(err.to_string());
                task.set_status(TaskStatus::Failed);
                self.events.publish_error(task_id, err.to_string());
            }
        }
        let _ = self.store.upsert_task(&task).await;
        self.events.publish_status(task_id, task.status);
    }

    pub async fn approve_plan(self: Arc<Self>, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::ApprovePlan)?;
        task.set_status(TaskStatus::Coding);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);

        let info = self.worktrees.create_for_task(&task)?;
        let this = Arc::clone(&self);
        let prompt = execute_prompt(&task);
        let hosted = self.hosted_credential(&task);
        let worktree_dir = info.path.clone();
        let target_branch = task.target_branch.clone();
        tokio::spawn(async move {
            let outcome = this
                .drive_run(task_id, RunMode::Execute, prompt, worktree_dir, hosted)
                .await;
            this.finish_coding(task_id, &target_branch, outcome).await;
        });

        self.store.require_task(task_id).await.map_err(OrchestratorError::from)
    }

    async fn finish_coding(&self, task_id: Uuid, target_branch: &str, outcome: Result<String, OrchestratorError>) {
        let Ok(mut task) = self.store.require_task(task_id).await else {
            return;
        };
        match outcome {
            Ok(_) => {
                if let Ok(info) = self.worktrees.create_for_task(&task) {
                    match self.worktrees.diff_for_task(&info, target_branch) {
                        Ok(diff) => task.diff_snapshot = Some(diff),
                        Err(err) => warn!(task_id = %task_id, error = %err, "failed to capture diff snapshot"),
                    }
                }
                task.set_status(TaskStatus::AwaitingReview);
                self.events
                    .publish_awaiting_review(task_id, "agent run complete, ready for review");
            }
            Err(err) => {
                task.error = Some(err.to_string());
                task.set_status(TaskStatus::Failed);
                self.events.publish_error(task_id, err.to_string());
            }
        }
        let _ = self.store.upsert_task(&task).await;
        self.events.publish_status(task_id, task.status);
    }

    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::Cancel)?;
        self.runner.cancel(task_id);
        task.set_status(TaskStatus::Canceled);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);
        Ok(task)
    }

    /// Feedback behaves differently depending on whether an agent is
    /// currently running for this task: while running, the message is
    /// recorded for the agent to see on its next resumption (this runner
    /// does not expose a live stdin handle for in-flight delivery); once
    /// idle, `plan_review` feedback is treated as plan approval, any other
    /// non-terminal status re-enters planning with the chat history plus
    /// this message folded into a resume prompt.
    pub async fn feedback(self: Arc<Self>, task_id: Uuid, message: String) -> Result<Task, OrchestratorError> {
        let task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::Feedback)?;

        let chat = ChatEvent::message(task_id, ChatRole::User, message.clone());
        self.store.append_chat_event(&chat).await?;
        self.events.publish_chat_message(task_id, ChatRole::User, message.clone());

        let running = self.runner.locks().try_acquire(task_id).is_none();
        if running {
            return self.store.require_task(task_id).await.map_err(OrchestratorError::from);
        }

        if task.status == TaskStatus::PlanReview {
            return self.approve_plan(task_id).await;
        }

        let mut task = task;
        task.review_feedback = Some(message.clone());
        task.set_status(TaskStatus::Planning);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);

        let history = self.store.chat_history(task_id).await?;
        let info = self.worktrees.create_for_task(&task)?;
        let this = Arc::clone(&self);
        let prompt = resume_prompt(&task, &history, &message);
        let hosted = self.hosted_credential(&task);
        let worktree_dir = info.path.clone();
        let target_branch = task.target_branch.clone();
        tokio::spawn(async move {
            let outcome = this
                .drive_run(task_id, RunMode::Resume, prompt, worktree_dir, hosted)
                .await;
            this.finish_coding(task_id, &target_branch, outcome).await;
        });

        self.store.require_task(task_id).await.map_err(OrchestratorError::from)
    }

    pub async fn extend_timeout(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::ExtendTimeout)?;
        let running = self.runner.locks().try_acquire(task_id).is_none();
        if !running {
            return Err(OrchestratorError::NotRunning);
        }
        let deadline = self.deadline_for(task_id);
        let mut guard = deadline.lock().await;
        *guard += Duration::from_secs(self.config.agent_timeout_extend_secs);
        Ok(task)
    }

    // -- PR lifecycle --------------------------------------------------

    pub async fn approve_pr(&self, task_id: Uuid) -> Result<String, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::ApprovePr)?;

        let info = self.worktrees.create_for_task(&task)?;
        match self.worktrees.sync_with_target(&info, &task.target_branch)? {
            MergeOutcome::Conflicts(files) => {
                task.conflict_files = files.clone();
                task.set_status(TaskStatus::MergeConflicts);
                self.store.upsert_task(&task).await?;
                self.events.publish_status(task_id, task.status);
                Err(OrchestratorError::MergeConflict(files))
            }
            MergeOutcome::UpToDate | MergeOutcome::Merged => self.push_and_open_pr(task, &info).await,
        }
    }

    pub async fn request_changes(&self, task_id: Uuid, feedback: String) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::RequestChanges)?;
        task.review_feedback = Some(feedback);
        task.set_status(TaskStatus::ChangesRequested);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);
        Ok(task)
    }

    pub async fn pr_merged(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::PrMerged)?;
        task.set_status(TaskStatus::Done);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);
        if let Some(pr_url) = &task.pr_url {
            self.events.publish_complete(task_id, pr_url.clone());
        }
        Ok(task)
    }

    pub async fn pr_closed(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::PrClosed)?;
        task.set_status(TaskStatus::Canceled);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task_id, task.status);
        Ok(task)
    }

    pub async fn resolve_conflicts(&self, task_id: Uuid) -> Result<String, OrchestratorError> {
        let task = self.store.require_task(task_id).await?;
        task.check_action(TaskAction::ResolveConflicts)?;
        let info = self.worktrees.create_for_task(&task)?;
        let remaining = self.worktrees.remaining_conflict_markers(&info, &task.conflict_files)?;
        if !remaining.is_empty() {
            return Err(OrchestratorError::ConflictsRemain(remaining));
        }
        let mut task = task;
        task.conflict_files.clear();
        self.push_and_open_pr(task, &info).await
    }

    async fn push_and_open_pr(&self, mut task: Task, info: &WorktreeInfo) -> Result<String, OrchestratorError> {
        let token = self.forge_token(&task.repo_url);
        let push_result = self
            .worktrees
            .push(info, &task.repo_url, token.as_deref().unwrap_or(""))?;
        if let PushResult::Rejected(stderr) = push_result {
            task.error = Some(stderr.clone());
            task.set_status(TaskStatus::Failed);
            self.store.upsert_task(&task).await?;
            self.events.publish_error(task.id, stderr.clone());
            return Err(OrchestratorError::Unexpected(format!("push rejected: {stderr}")));
        }

        let pr_url = self
            .forge
            .create_pull_request(
                &task.repo_url,
                &info.branch,
                &task.target_branch,
                &task.title,
                task.final_specification.as_deref().unwrap_or(""),
                token.as_deref(),
            )
            .await?;

        task.pr_url = Some(pr_url.clone());
        task.set_status(TaskStatus::PrCreated);
        self.store.upsert_task(&task).await?;
        self.events.publish_status(task.id, task.status);
        self.events.publish_complete(task.id, pr_url.clone());
        Ok(pr_url)
    }

    fn forge_token(&self, repo_url: &str) -> Option<String> {
        let is_gitlab = repo_url.contains("gitlab.com");
        let provider = if is_gitlab { SecretProvider::Gitlab } else { SecretProvider::Github };
        self.secrets
            .get_plaintext(SecretKind::ForgeToken, provider)
            .ok()
            .or_else(|| {
                if is_gitlab {
                    self.config.gitlab_token.clone()
                } else {
                    self.config.github_token.clone()
                }
            })
    }

    // -- secrets --------------------------------------------------

    /// Validates and persists a credential. On a successful AI-key save, the
    /// CLI-backend availability cache is invalidated so the next run picks
    /// up the new auth state instead of a stale "not installed" result.
    pub async fn save_secret(
        &self,
        kind: SecretKind,
        provider: SecretProvider,
        plaintext: String,
        metadata: ao_core::types::SecretMetadata,
        reject_invalid: bool,
    ) -> Result<ao_core::secret_store::ValidationOutcome, OrchestratorError> {
        let outcome = self
            .secrets
            .save(kind, provider, plaintext, metadata, reject_invalid)
            .await?;
        if outcome.valid && kind == SecretKind::AiKey {
            self.runner.registry().invalidate_all();
        }
        Ok(outcome)
    }

    pub fn secret_status(&self, kind: SecretKind, provider: SecretProvider) -> ao_core::types::SecretStatus {
        self.secrets.status(kind, provider)
    }

    pub fn delete_secret(&self, kind: SecretKind, provider: SecretProvider) -> Result<(), OrchestratorError> {
        self.secrets.delete(kind, provider)?;
        Ok(())
    }

    // -- worktree / deletion --------------------------------------------------

    pub async fn cleanup_worktree(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let mut task = self.store.require_task(task_id).await?;
        if self.runner.locks().try_acquire(task_id).is_none() {
            return Err(OrchestratorError::AlreadyRunning);
        }
        let info = self.worktrees.create_for_task(&task)?;
        self.worktrees
            .cleanup(&info)
            .map_err(|e| OrchestratorError::CleanupFailure(e.to_string()))?;
        task.touch();
        self.store.upsert_task(&task).await?;
        Ok(task)
    }

    pub async fn delete(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        let task = self.store.require_task(task_id).await?;
        if self.runner.locks().try_acquire(task_id).is_none() {
            self.runner.cancel(task_id);
        }
        if let Ok(info) = self.worktrees.create_for_task(&task) {
            let worktrees = Arc::clone(&self.worktrees);
            tokio::spawn(async move {
                if let Err(err) = worktrees.cleanup(&info) {
                    warn!(task_id = %task_id, error = %err, "background worktree cleanup failed");
                }
            });
        }
        self.store.delete_task(task_id).await?;
        self.events.forget(task_id);
        Ok(())
    }

    // -- event stream --------------------------------------------------

    pub async fn open_stream(&self, task_id: Uuid) -> Result<StreamOpen, OrchestratorError> {
        let task = self.store.require_task(task_id).await?;
        let logs = self.store.log_tail(task_id, self.config.event_log_buffer_size).await?;
        let chat = self.store.chat_history(task_id).await?;

        let immediate = if task.status.is_terminal() {
            match task.status {
                TaskStatus::Failed => Some(EventRecord::Error {
                    task_id,
                    message: task.error.clone().unwrap_or_else(|| "task failed".to_string()),
                }),
                _ => task.pr_url.clone().map(|pr_url| EventRecord::Complete { task_id, pr_url }),
            }
        } else if matches!(task.status, TaskStatus::AwaitingReview | TaskStatus::PlanReview) {
            Some(EventRecord::AwaitingReview {
                task_id,
                message: "awaiting review".to_string(),
            })
        } else if matches!(task.status, TaskStatus::Refining | TaskStatus::Planning | TaskStatus::Coding) {
            Some(EventRecord::TimeoutWarning {
                task_id,
                running_since: task.updated_at,
                timeout_at: task.updated_at + Duration::from_secs(self.config.agent_timeout_secs),
            })
        } else {
            None
        };

        let live = self.events.subscribe(task_id);
        Ok(StreamOpen {
            logs,
            chat,
            status: task.status,
            immediate,
            live,
        })
    }

    // -- shared run machinery --------------------------------------------------

    fn deadline_for(&self, task_id: Uuid) -> Arc<AsyncMutex<Instant>> {
        self.deadlines
            .entry(task_id)
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(
                    Instant::now() + Duration::from_secs(self.config.agent_timeout_secs),
                ))
            })
            .clone()
    }

    fn hosted_credential(&self, task: &Task) -> Option<HostedCredential> {
        let provider = HostedProvider::Anthropic;
        let (secret_provider, default_model) = match provider {
            HostedProvider::Anthropic => (SecretProvider::Anthropic, "claude-3-5-sonnet-latest"),
            HostedProvider::OpenAi => (SecretProvider::OpenAi, "gpt-4o"),
            HostedProvider::OpenRouter => (SecretProvider::OpenRouter, "anthropic/claude-3.5-sonnet"),
        };
        let api_key = self.secrets.get_plaintext(SecretKind::AiKey, secret_provider).ok()?;
        Some(HostedCredential {
            provider,
            api_key,
            model: task.agent_model.clone().unwrap_or_else(|| default_model.to_string()),
        })
    }

    /// Resets the run deadline, drives the agent runner, and forwards every
    /// [`AgentEvent`] it emits onto the chat/log store and the event hub via
    /// an unbounded channel so the runner's synchronous callback never blocks
    /// on a database write.
    async fn drive_run(
        self: &Arc<Self>,
        task_id: Uuid,
        mode: RunMode,
        prompt: String,
        worktree_dir: String,
        hosted: Option<HostedCredential>,
    ) -> Result<String, OrchestratorError> {
        let task = self.store.require_task(task_id).await?;
        let deadline = self.deadline_for(task_id);
        {
            let mut guard = deadline.lock().await;
            *guard = Instant::now() + Duration::from_secs(self.config.agent_timeout_secs);
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
        let this = Arc::clone(self);
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.record_event(task_id, event).await;
            }
        });

        let default_backend = CliBackendKind::ClaudeCode;
        let result = self
            .runner
            .run(
                &task,
                mode,
                prompt,
                &worktree_dir,
                default_backend,
                hosted.as_ref(),
                deadline,
                move |event| {
                    let _ = tx.send(event);
                },
            )
            .await;

        let _ = drain.await;
        result.map_err(OrchestratorError::from)
    }

    async fn record_event(&self, task_id: Uuid, event: AgentEvent) {
        match event {
            AgentEvent::AssistantText { text } => {
                let chat = ChatEvent::message(task_id, ChatRole::Assistant, text.clone());
                let _ = self.store.append_chat_event(&chat).await;
                self.events.publish_chat_message(task_id, ChatRole::Assistant, text);
            }
            AgentEvent::ToolCall { name, summary } | AgentEvent::ToolResult { name, summary } => {
                let chat = ChatEvent::tool_activity(task_id, name.clone(), summary.clone());
                let _ = self.store.append_chat_event(&chat).await;
                self.events.publish_tool_activity(task_id, name, summary);
            }
            AgentEvent::Completion { .. } | AgentEvent::Heartbeat => {}
            AgentEvent::BackendError { subtype, message } => {
                let line = format!("{subtype}: {message}");
                let entry = LogEntry::new(task_id, LogLevel::Error, line.clone());
                let _ = self.store.append_log(&entry).await;
                self.events.publish_log(task_id, LogLevel::Error, line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_core::git_read_adapter::default_read_adapter;
    use ao_core::secret_store::{SecretValidator, ValidationOutcome};
    use ao_core::types::SecretMetadata;
    use ao_core::worktree_manager::SharedMockGitRunner;
    use ao_harness::process_supervisor::ProcessSupervisor;

    struct AlwaysValid;

    #[async_trait::async_trait]
    impl SecretValidator for AlwaysValid {
        async fn validate(&self, _kind: SecretKind, _provider: SecretProvider, _plaintext: &str) -> ValidationOutcome {
            ValidationOutcome { valid: true, detail: None }
        }
    }

    async fn orchestrator_with_mock_git() -> (Arc<TaskOrchestrator>, tempfile::TempDir) {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let repos_dir = tempfile::tempdir().unwrap();
        let worktrees_dir = tempfile::tempdir().unwrap();
        let mock = SharedMockGitRunner::new();
        let worktrees = Arc::new(WorktreeManager::with_adapters(
            repos_dir.path(),
            worktrees_dir.path(),
            Box::new(mock),
            default_read_adapter(),
        ));
        let runner = Arc::new(AgentRunner::new(ProcessSupervisor::new(), 15, 300));
        let events = Arc::new(EventHub::new());
        let secrets_dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(
            SecretStore::open(secrets_dir.path())
                .unwrap()
                .with_validator(Box::new(AlwaysValid)),
        );
        let config = Arc::new(Config::default());
        let orchestrator = Arc::new(TaskOrchestrator::new(store, worktrees, runner, events, secrets, config));
        (orchestrator, repos_dir)
    }

    #[tokio::test]
    async fn create_and_get_task_roundtrip() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        let created = orchestrator.create_task(task.clone()).await.unwrap();
        let fetched = orchestrator.get_task(created.id).await.unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Draft);
    }

    #[tokio::test]
    async fn generate_spec_rejects_from_non_draft_status() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let mut task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        task.status = TaskStatus::Done;
        orchestrator.create_task(task.clone()).await.unwrap();
        let err = Arc::clone(&orchestrator).generate_spec(task.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Transition(_)));
    }

    #[tokio::test]
    async fn edit_spec_sets_was_edited() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let mut task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        task.status = TaskStatus::PendingApproval;
        orchestrator.create_task(task.clone()).await.unwrap();

        let updated = orchestrator
            .edit_spec(task.id, "a tighter specification".to_string())
            .await
            .unwrap();
        assert!(updated.was_edited);
        assert_eq!(updated.generated_spec.as_deref(), Some("a tighter specification"));
    }

    #[tokio::test]
    async fn update_task_applies_partial_patch() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        orchestrator.create_task(task.clone()).await.unwrap();

        let patch = TaskPatch {
            title: Some("Add retries with backoff".to_string()),
            ..Default::default()
        };
        let updated = orchestrator.update_task(task.id, patch).await.unwrap();
        assert_eq!(updated.title, "Add retries with backoff");
        assert_eq!(updated.description, "desc");
    }

    #[tokio::test]
    async fn cancel_requires_a_cancelable_status() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        orchestrator.create_task(task.clone()).await.unwrap();
        let err = orchestrator.cancel(task.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Transition(_)));
    }

    #[tokio::test]
    async fn delete_removes_task_and_forgets_subscribers() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        orchestrator.create_task(task.clone()).await.unwrap();
        orchestrator.delete(task.id).await.unwrap();
        assert!(orchestrator.get_task(task.id).await.is_err());
    }

    #[tokio::test]
    async fn request_changes_requires_pr_created() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        orchestrator.create_task(task.clone()).await.unwrap();
        let err = orchestrator
            .request_changes(task.id, "please add tests".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Transition(_)));
    }

    #[tokio::test]
    async fn open_stream_emits_timeout_warning_for_running_task() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let mut task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        task.status = TaskStatus::Coding;
        orchestrator.create_task(task.clone()).await.unwrap();

        let open = orchestrator.open_stream(task.id).await.unwrap();
        match open.immediate {
            Some(EventRecord::TimeoutWarning { task_id, running_since, timeout_at }) => {
                assert_eq!(task_id, task.id);
                assert!(timeout_at > running_since);
            }
            other => panic!("expected a timeout_warning event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_stream_emits_complete_for_terminal_task_with_pr() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        let mut task = Task::new("Add retries", "desc", "https://example.com/repo.git");
        task.status = TaskStatus::Done;
        task.pr_url = Some("https://example.com/pr/1".to_string());
        orchestrator.create_task(task.clone()).await.unwrap();

        let open = orchestrator.open_stream(task.id).await.unwrap();
        assert!(matches!(open.immediate, Some(EventRecord::Complete { .. })));
    }

    #[test]
    fn compare_url_targets_github_when_remote_is_github() {
        let url = build_compare_url("https://github.com/acme/repo.git", "main", "feature/x-1234");
        assert_eq!(url, "https://github.com/acme/repo/compare/main...feature/x-1234?expand=1");
    }

    #[test]
    fn compare_url_falls_back_for_non_forge_remotes() {
        let url = build_compare_url("file:///tmp/demo.git", "main", "feature/x-1234");
        assert_eq!(url, "file:///tmp/demo.git/compare/main...feature/x-1234");
    }

    #[tokio::test]
    async fn save_secret_invalidates_backend_registry_on_valid_ai_key() {
        let (orchestrator, _guard) = orchestrator_with_mock_git().await;
        orchestrator.runner.registry().force_available(CliBackendKind::ClaudeCode, true);
        assert!(orchestrator.runner.registry().is_available(CliBackendKind::ClaudeCode));

        orchestrator
            .save_secret(
                SecretKind::AiKey,
                SecretProvider::Anthropic,
                "sk-test-key".to_string(),
                SecretMetadata::default(),
                true,
            )
            .await
            .unwrap();

        // invalidate_all() clears the cached (forced) entry; the registry
        // now re-probes the real filesystem for `claude`, which this test
        // environment does not have installed.
        assert!(!orchestrator.runner.registry().is_available(CliBackendKind::ClaudeCode));
    }

    #[tokio::test]
    async fn save_secret_rejects_invalid_credential_when_reject_invalid_is_set() {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let repos_dir = tempfile::tempdir().unwrap();
        let worktrees_dir = tempfile::tempdir().unwrap();
        let worktrees = Arc::new(WorktreeManager::new(repos_dir.path(), worktrees_dir.path()));
        let runner = Arc::new(AgentRunner::new(ProcessSupervisor::new(), 15, 300));
        let events = Arc::new(EventHub::new());
        let secrets_dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(
            SecretStore::open(secrets_dir.path()).unwrap().with_validator(Box::new(AlwaysInvalid)),
        );
        let config = Arc::new(Config::default());
        let orchestrator = TaskOrchestrator::new(store, worktrees, runner, events, secrets, config);

        let err = orchestrator
            .save_secret(
                SecretKind::AiKey,
                SecretProvider::OpenAi,
                "bad-key".to_string(),
                SecretMetadata::default(),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Secret(_)));
    }

    #[tokio::test]
    async fn forge_token_falls_back_to_config_when_no_secret_stored() {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let repos_dir = tempfile::tempdir().unwrap();
        let worktrees_dir = tempfile::tempdir().unwrap();
        let worktrees = Arc::new(WorktreeManager::with_adapters(
            repos_dir.path(),
            worktrees_dir.path(),
            Box::new(SharedMockGitRunner::new()),
            default_read_adapter(),
        ));
        let runner = Arc::new(AgentRunner::new(ProcessSupervisor::new(), 15, 300));
        let events = Arc::new(EventHub::new());
        let secrets_dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(
            SecretStore::open(secrets_dir.path()).unwrap().with_validator(Box::new(AlwaysValid)),
        );
        let config = Arc::new(Config {
            github_token: Some("ghp_fromconfig".to_string()),
            ..Config::default()
        });
        let orchestrator = TaskOrchestrator::new(store, worktrees, runner, events, secrets, config);

        assert_eq!(
            orchestrator.forge_token("https://github.com/acme/repo.git").as_deref(),
            Some("ghp_fromconfig")
        );
        assert_eq!(orchestrator.forge_token("https://gitlab.com/acme/repo.git"), None);
    }

    struct AlwaysInvalid;

    #[async_trait::async_trait]
    impl SecretValidator for AlwaysInvalid {
        async fn validate(&self, _kind: SecretKind, _provider: SecretProvider, _plaintext: &str) -> ValidationOutcome {
            ValidationOutcome { valid: false, detail: Some("credential rejected by provider".to_string()) }
        }
    }
}
