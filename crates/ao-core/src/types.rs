//! Domain types shared across the orchestrator: tasks, their lifecycle,
//! chat/log events, worktrees, repositories, diffs, and stored secrets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// The lifecycle state of a task.
///
/// Every mutating HTTP action is checked against [`TaskAction`]'s allow-list
/// before it is permitted to fire; illegal transitions are rejected with
/// [`TransitionError`] rather than silently applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Refining,
    PendingApproval,
    Approved,
    Planning,
    PlanReview,
    Coding,
    AwaitingReview,
    MergeConflicts,
    PrCreated,
    ChangesRequested,
    Done,
    Canceled,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Refining => "refining",
            TaskStatus::PendingApproval => "pending_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Planning => "planning",
            TaskStatus::PlanReview => "plan_review",
            TaskStatus::Coding => "coding",
            TaskStatus::AwaitingReview => "awaiting_review",
            TaskStatus::MergeConflicts => "merge_conflicts",
            TaskStatus::PrCreated => "pr_created",
            TaskStatus::ChangesRequested => "changes_requested",
            TaskStatus::Done => "done",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

impl TaskStatus {
    /// Terminal statuses never accept another transition and carry a frozen
    /// `diff_snapshot` captured before worktree cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Canceled | TaskStatus::Failed)
    }
}

/// The HTTP-facing actions the orchestrator can be asked to perform.
///
/// Each variant owns the allow-list of statuses it may fire from — the
/// single source of truth behind every mutating endpoint. A status machine
/// driven off anything else (ad-hoc `if` chains scattered across handlers)
/// is the bug this type exists to make unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    GenerateSpec,
    RegenerateSpec,
    EditSpec,
    ApproveSpec,
    Start,
    ApprovePlan,
    Cancel,
    /// Whether this resumes a paused agent or queues for later depends on
    /// whether an agent is currently running; see
    /// `TaskOrchestrator::feedback` in `ao-agents`.
    Feedback,
    ExtendTimeout,
    ApprovePr,
    RequestChanges,
    PrMerged,
    PrClosed,
    ResolveConflicts,
    CleanupWorktree,
    Delete,
}

impl TaskAction {
    /// The statuses from which this action may be invoked. `Delete` and
    /// `CleanupWorktree` are gated by the orchestrator on agent-running
    /// state rather than status alone, so they report an empty slice here.
    pub fn allowed_from(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            TaskAction::GenerateSpec => &[Draft],
            TaskAction::RegenerateSpec => &[PendingApproval],
            TaskAction::EditSpec => &[PendingApproval],
            TaskAction::ApproveSpec => &[PendingApproval],
            TaskAction::Start => &[Draft, Approved, Failed, ChangesRequested],
            TaskAction::ApprovePlan => &[PlanReview],
            TaskAction::Cancel => &[
                Refining,
                Planning,
                PlanReview,
                Coding,
                Approved,
                AwaitingReview,
            ],
            TaskAction::Feedback => &[
                Refining,
                PendingApproval,
                Approved,
                Planning,
                PlanReview,
                Coding,
                AwaitingReview,
                MergeConflicts,
                PrCreated,
                ChangesRequested,
            ],
            TaskAction::ExtendTimeout => &[Refining, Planning, Coding],
            TaskAction::ApprovePr => &[AwaitingReview],
            TaskAction::RequestChanges => &[PrCreated, AwaitingReview],
            TaskAction::PrMerged => &[PrCreated, AwaitingReview],
            TaskAction::PrClosed => &[PrCreated, AwaitingReview, ChangesRequested],
            TaskAction::ResolveConflicts => &[MergeConflicts],
            TaskAction::CleanupWorktree => &[],
            TaskAction::Delete => &[],
        }
    }

    /// Whether `status` permits this action, for actions whose rule is fully
    /// captured by status membership.
    pub fn permits(self, status: TaskStatus) -> bool {
        self.allowed_from().contains(&status)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("action {action:?} is not permitted from status {status}")]
pub struct TransitionError {
    pub action: TaskAction,
    pub status: TaskStatus,
}

// ---------------------------------------------------------------------------
// CliBackendKind
// ---------------------------------------------------------------------------

/// The closed set of agent backends the orchestrator knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliBackendKind {
    ClaudeCode,
    Codex,
    Copilot,
    Gemini,
    HostedApi,
}

impl fmt::Display for CliBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CliBackendKind::ClaudeCode => "claude_code",
            CliBackendKind::Codex => "codex",
            CliBackendKind::Copilot => "copilot",
            CliBackendKind::Gemini => "gemini",
            CliBackendKind::HostedApi => "hosted_api",
        };
        write!(f, "{label}")
    }
}

impl CliBackendKind {
    /// The executable name looked up on `PATH` for CLI-driven backends.
    /// Returns `None` for backends that are not CLI processes.
    pub fn executable_name(self) -> Option<&'static str> {
        match self {
            CliBackendKind::ClaudeCode => Some("claude"),
            CliBackendKind::Codex => Some("codex"),
            CliBackendKind::Copilot => Some("gh-copilot"),
            CliBackendKind::Gemini => Some("gemini"),
            CliBackendKind::HostedApi => None,
        }
    }

    /// Whether this backend requires a prompt file plus shell indirection
    /// instead of a direct argv entry (some installers are thin wrapper
    /// scripts that choke on long multi-line arguments).
    pub fn needs_prompt_file(self) -> bool {
        matches!(self, CliBackendKind::ClaudeCode | CliBackendKind::Gemini)
    }

    /// Whether this backend needs an explicit sentinel argument to enable
    /// stdin piping of follow-up turns.
    pub fn stdin_sentinel(self) -> Option<&'static str> {
        match self {
            CliBackendKind::ClaudeCode => Some("--input-format=stream-json"),
            _ => None,
        }
    }
}

/// A hosted chat-completions provider, used when the backend kind is
/// [`CliBackendKind::HostedApi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostedProvider {
    Anthropic,
    OpenAi,
    OpenRouter,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// The user's original free-text request, preserved verbatim so
    /// resumption prompts can reference it even after `generated_spec` has
    /// since been edited.
    pub user_input: String,
    pub status: TaskStatus,

    pub repo_url: String,
    pub repository_id: Option<Uuid>,
    pub target_branch: String,
    pub branch_name: Option<String>,

    pub context_files: Vec<String>,
    pub build_command: Option<String>,

    pub backend: CliBackendKind,
    pub agent_model: Option<String>,

    pub generated_spec: Option<String>,
    pub was_edited: bool,
    pub final_specification: Option<String>,
    pub plan: Option<String>,
    pub review_feedback: Option<String>,

    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub diff_snapshot: Option<DiffSummary>,
    pub conflict_files: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, repo_url: impl Into<String>) -> Self {
        let now = Utc::now();
        let description = description.into();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            user_input: description.clone(),
            description,
            status: TaskStatus::Draft,
            repo_url: repo_url.into(),
            repository_id: None,
            target_branch: "main".to_string(),
            branch_name: None,
            context_files: Vec::new(),
            build_command: None,
            backend: CliBackendKind::ClaudeCode,
            agent_model: None,
            generated_spec: None,
            was_edited: false,
            final_specification: None,
            plan: None,
            review_feedback: None,
            pr_url: None,
            error: None,
            diff_snapshot: None,
            conflict_files: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Branch name derived from the title and the task id:
    /// `feature/<slug-of-title>-<first-8-chars-of-task-id>`.
    pub fn derive_branch_name(&self) -> String {
        let slug = slugify(&self.title);
        let short_id: String = self.id.simple().to_string().chars().take(8).collect();
        format!("feature/{slug}-{short_id}")
    }

    /// Apply `action`, returning an error if `action` is not permitted from
    /// the current status. Actions requiring extra runtime context (agent
    /// running/idle, conflict markers present) are checked by the caller in
    /// addition to this — see `ao-agents::orchestrator::TaskOrchestrator`.
    pub fn check_action(&self, action: TaskAction) -> Result<(), TransitionError> {
        if action.permits(self.status) {
            Ok(())
        } else {
            Err(TransitionError {
                action,
                status: self.status,
            })
        }
    }

    /// Move the task to `next` unconditionally, stamping `updated_at`.
    /// Callers are expected to have already validated the transition via
    /// [`Task::check_action`] or the orchestrator's extra runtime checks.
    pub fn set_status(&mut self, next: TaskStatus) {
        self.status = next;
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn slugify(title: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "task".to_string()
    } else {
        out
    }
}

// ---------------------------------------------------------------------------
// ChatEvent / LogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// An append-only chat/tool-activity record: either a chat message or a
/// one-line tool-activity summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatEvent {
    Message {
        id: Uuid,
        task_id: Uuid,
        role: ChatRole,
        text: String,
        created_at: DateTime<Utc>,
    },
    ToolActivity {
        id: Uuid,
        task_id: Uuid,
        tool_name: String,
        summary: String,
        created_at: DateTime<Utc>,
    },
}

impl ChatEvent {
    pub fn message(task_id: Uuid, role: ChatRole, text: impl Into<String>) -> Self {
        ChatEvent::Message {
            id: Uuid::new_v4(),
            task_id,
            role,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn tool_activity(task_id: Uuid, tool_name: impl Into<String>, summary: impl Into<String>) -> Self {
        ChatEvent::ToolActivity {
            id: Uuid::new_v4(),
            task_id,
            tool_name: tool_name.into(),
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            ChatEvent::Message { task_id, .. } => *task_id,
            ChatEvent::ToolActivity { task_id, .. } => *task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Agent,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(task_id: Uuid, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// BareRepo / Worktree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BareRepo {
    pub repo_url: String,
    pub local_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub task_id: Uuid,
    pub path: String,
    pub bare_repo_path: String,
    pub branch: String,
    pub created_from_empty_repo: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DiffEntry / DiffSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub status: DiffStatus,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files: Vec<DiffEntry>,
    pub diff: String,
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    AiKey,
    ForgeToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretProvider {
    Anthropic,
    OpenAi,
    OpenRouter,
    Github,
    Gitlab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeConnectionMethod {
    OAuth,
    PersonalAccessToken,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub label: Option<String>,
    pub avatar_url: Option<String>,
    pub connection_method: Option<ForgeConnectionMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStatus {
    pub kind: SecretKind,
    pub provider: SecretProvider,
    pub present: bool,
    pub metadata: SecretMetadata,
    pub updated_at: Option<DateTime<Utc>>,
}
