//! AgentRunner: selects a backend, spawns it, and drives it to completion or
//! timeout, translating its output into [`AgentEvent`]s for a caller-supplied
//! sink. One run owns one task's single-task concurrency lock for its
//! lifetime.

use std::sync::Arc;
use std::time::Duration;

use ao_core::types::{CliBackendKind, HostedProvider, Task};
use ao_harness::process_supervisor::ProcessSupervisor;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{
    pump_cli_output, spawn_cli_backend, write_feedback_line, AgentEvent, BackendError,
    BackendRegistry, HostedBackend, SelectedBackend,
};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no backend available")]
    NoBackendAvailable,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("run timed out after {0:?}")]
    Timeout(Duration),
    #[error("run was canceled")]
    Canceled,
    #[error("task {0} already has a run in progress")]
    AlreadyRunning(Uuid),
}

/// Which hosted credential is available, looked up by the caller (typically
/// via the secret store) before a run starts.
pub struct HostedCredential {
    pub provider: HostedProvider,
    pub api_key: String,
    pub model: String,
}

/// What mode a run executes: spec generation, execution of an approved
/// spec, or resumption with prior history folded into the prompt.
pub enum RunMode {
    SpecGeneration,
    Execute,
    Resume,
}

/// Picks a backend per §4.2's selection order. The Claude-Code CLI is
/// skipped in spec-generation mode in favor of a hosted Anthropic credential
/// when both are available, since the CLI's sandboxed tool calls cost time
/// and tokens for no benefit when all that's wanted is a text spec.
/// Whether `candidate` is avoided in this mode — just the narrow
/// Claude-Code-in-spec-generation exception, not every CLI backend.
fn avoid_in_mode(mode: &RunMode, candidate: CliBackendKind) -> bool {
    matches!(mode, RunMode::SpecGeneration) && candidate == CliBackendKind::ClaudeCode
}

pub fn select_backend(
    mode: &RunMode,
    registry: &BackendRegistry,
    task_backend: CliBackendKind,
    default_backend: CliBackendKind,
    hosted: Option<&HostedCredential>,
) -> Option<SelectedBackend> {
    let avoid_task_cli = avoid_in_mode(mode, task_backend);
    let avoid_default_cli = avoid_in_mode(mode, default_backend);

    if !avoid_task_cli && registry.is_available(task_backend) {
        return Some(SelectedBackend::Cli(task_backend));
    }
    if !avoid_default_cli && registry.is_available(default_backend) {
        return Some(SelectedBackend::Cli(default_backend));
    }
    if let Some(cred) = hosted {
        return Some(SelectedBackend::Hosted(cred.provider));
    }
    if avoid_task_cli && registry.is_available(task_backend) {
        return Some(SelectedBackend::Cli(task_backend));
    }
    if avoid_default_cli && registry.is_available(default_backend) {
        return Some(SelectedBackend::Cli(default_backend));
    }
    None
}

/// Tracks whether a task currently has a live run, so the orchestrator can
/// reject an overlapping `start`/`execute` with `AlreadyRunning`.
#[derive(Clone, Default)]
pub struct RunLocks {
    locks: Arc<dashmap::DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn try_acquire(&self, task_id: Uuid) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.lock_for(task_id).try_lock_owned().ok()
    }
}

pub struct AgentRunner {
    supervisor: ProcessSupervisor,
    registry: BackendRegistry,
    hosted: HostedBackend,
    locks: RunLocks,
    heartbeat_interval: Duration,
    initial_timeout: Duration,
}

impl AgentRunner {
    pub fn new(supervisor: ProcessSupervisor, heartbeat_secs: u64, initial_timeout_secs: u64) -> Self {
        Self {
            supervisor,
            registry: BackendRegistry::new(),
            hosted: HostedBackend::new(),
            locks: RunLocks::new(),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            initial_timeout: Duration::from_secs(initial_timeout_secs),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &RunLocks {
        &self.locks
    }

    /// Runs `prompt` against the selected backend inside `worktree_dir`,
    /// streaming events to `on_event`. `deadline` is owned by the caller so
    /// `extend-timeout` can push it out while the run is already underway.
    pub async fn run<F>(
        &self,
        task: &Task,
        mode: RunMode,
        prompt: String,
        worktree_dir: &str,
        default_backend: CliBackendKind,
        hosted: Option<&HostedCredential>,
        deadline: Arc<Mutex<tokio::time::Instant>>,
        mut on_event: F,
    ) -> Result<String, RunnerError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let _guard = self
            .locks
            .try_acquire(task.id)
            .ok_or(RunnerError::AlreadyRunning(task.id))?;

        let selected = select_backend(&mode, &self.registry, task.backend, default_backend, hosted)
            .ok_or(RunnerError::NoBackendAvailable)?;

        match selected {
            SelectedBackend::Cli(kind) => {
                self.run_cli(kind, &prompt, worktree_dir, task.id, deadline, &mut on_event)
                    .await
            }
            SelectedBackend::Hosted(provider) => {
                let cred = hosted.ok_or(RunnerError::NoBackendAvailable)?;
                let event = self
                    .hosted
                    .complete(provider, &cred.api_key, &cred.model, &prompt)
                    .await?;
                let text = match &event {
                    AgentEvent::Completion { text } => text.clone(),
                    _ => String::new(),
                };
                on_event(event);
                Ok(text)
            }
        }
    }

    async fn run_cli<F>(
        &self,
        kind: CliBackendKind,
        prompt: &str,
        worktree_dir: &str,
        task_id: Uuid,
        deadline: Arc<Mutex<tokio::time::Instant>>,
        on_event: &mut F,
    ) -> Result<String, RunnerError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let mut process =
            spawn_cli_backend(&self.supervisor, kind, prompt, worktree_dir, task_id).await?;

        let mut completion = String::new();
        let supervisor = self.supervisor.clone();
        let pid = process.child.id();

        let heartbeat_interval = self.heartbeat_interval;
        let pump = pump_cli_output(&mut process, heartbeat_interval, |event| {
            if let AgentEvent::Completion { text } = &event {
                completion = text.clone();
            }
            on_event(event);
        });

        let watchdog = async {
            loop {
                let remaining = {
                    let at = *deadline.lock().await;
                    at.saturating_duration_since(tokio::time::Instant::now())
                };
                if remaining.is_zero() {
                    return;
                }
                tokio::time::sleep(remaining).await;
            }
        };

        tokio::select! {
            result = pump => {
                result?;
                let status = process.child.wait().await.ok();
                info!(task_id = %task_id, ?status, "agent run finished");
                Ok(completion)
            }
            _ = watchdog => {
                warn!(task_id = %task_id, "agent run timed out, tree-killing");
                if let Some(pid) = pid {
                    let _ = supervisor.tree_kill(pid);
                }
                Err(RunnerError::Timeout(self.initial_timeout))
            }
        }
    }

    /// Cancels a running agent for `task_id` by tree-killing its process
    /// group. The caller (orchestrator) is responsible for observing the
    /// resulting process death and marking the task canceled.
    pub fn cancel(&self, task_id: Uuid) {
        self.supervisor.kill_for_task(task_id);
    }
}

/// Forwards a feedback message to a running agent's stdin if possible.
/// Returns `true` if delivered live, `false` if the caller should instead
/// store it for the next resumption prompt.
pub async fn deliver_feedback(child: &mut tokio::process::Child, message: &str) -> bool {
    write_feedback_line(child, message).await
}
