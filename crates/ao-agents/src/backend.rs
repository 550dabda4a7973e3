//! Uniform agent-event stream over two backend shapes: a spawned CLI
//! executable whose streaming output is parsed line-by-line, and a single
//! request/response call to a hosted chat-completions API. Every backend
//! parser produces only [`AgentEvent`] so the rest of the system (event hub,
//! SSE writer) never has to know which backend produced a run.

use std::path::PathBuf;
use std::process::Stdio as StdStdio;
use std::time::Duration;

use ao_core::types::{CliBackendKind, HostedProvider};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tracing::{debug, warn};

/// A single unit of progress from a running agent, regardless of backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    AssistantText { text: String },
    ToolCall { name: String, summary: String },
    ToolResult { name: String, summary: String },
    Completion { text: String },
    BackendError { subtype: String, message: String },
    Heartbeat,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no backend available")]
    NoBackendAvailable,
    #[error("backend binary not found: {0}")]
    BinaryNotFound(String),
    #[error("spawn failed: {0}")]
    Spawn(#[from] ao_harness::process_supervisor::SupervisorError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("hosted api request failed: {0}")]
    Http(String),
    #[error("hosted api returned non-2xx: {status} {body}")]
    HostedStatus { status: u16, body: String },
}

/// Which credential/executable a run actually used, for logging and for the
/// "avoid Claude-Code CLI in spec mode" rule in the selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedBackend {
    Cli(CliBackendKind),
    Hosted(HostedProvider),
}

/// Probes installed/authenticated CLI backends and caches the result for the
/// process lifetime. Invalidated explicitly when a new AI-key secret lands.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    cache: dashmap::DashMap<CliBackendKind, bool>,
}

#[cfg(test)]
impl BackendRegistry {
    /// Test-only seam: force a backend's cached availability without
    /// touching the filesystem.
    pub(crate) fn force_available(&self, kind: CliBackendKind, available: bool) {
        self.cache.insert(kind, available);
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `kind`'s executable is installed and appears usable.
    /// Result is cached; call [`BackendRegistry::invalidate`] after a secret
    /// change that might affect CLI auth state.
    pub fn is_available(&self, kind: CliBackendKind) -> bool {
        if let Some(hit) = self.cache.get(&kind) {
            return *hit;
        }
        let available = kind
            .executable_name()
            .map(which_binary)
            .unwrap_or(false);
        self.cache.insert(kind, available);
        available
    }

    pub fn invalidate(&self, kind: CliBackendKind) {
        self.cache.remove(&kind);
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}

fn which_binary(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .stdout(StdStdio::null())
        .stderr(StdStdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// A running CLI-backend process plus the machinery to read its output as
/// [`AgentEvent`]s and to forward feedback on stdin while it's alive.
pub struct CliProcess {
    pub child: Child,
    pub kind: CliBackendKind,
    prompt_file: Option<PathBuf>,
}

impl Drop for CliProcess {
    fn drop(&mut self) {
        if let Some(path) = &self.prompt_file {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Spawns `kind`'s executable for `prompt`, handling the per-backend quirks
/// described in [`CliBackendKind`]: prompt-via-tempfile for backends whose
/// installers are shell-script wrappers unhappy with long argv entries, and
/// an explicit stdin-sentinel argument for backends that need one to enable
/// piping.
pub async fn spawn_cli_backend(
    supervisor: &ao_harness::process_supervisor::ProcessSupervisor,
    kind: CliBackendKind,
    prompt: &str,
    cwd: &str,
    task_id: uuid::Uuid,
) -> Result<CliProcess, BackendError> {
    use ao_harness::process_supervisor::StdioMode;

    let program = kind
        .executable_name()
        .ok_or_else(|| BackendError::BinaryNotFound(format!("{kind}")))?;

    let mut args: Vec<String> = Vec::new();
    let mut prompt_file = None;

    if kind.needs_prompt_file() {
        let path = std::env::temp_dir().join(format!("ao-prompt-{task_id}.txt"));
        tokio::fs::write(&path, prompt).await?;
        args.push("--prompt-file".to_string());
        args.push(path.display().to_string());
        prompt_file = Some(path);
    } else {
        args.push(prompt.to_string());
    }

    if let Some(sentinel) = kind.stdin_sentinel() {
        args.push(sentinel.to_string());
    }

    let child = supervisor.spawn(
        program,
        &args,
        StdioMode::Piped,
        StdioMode::Piped,
        StdioMode::Piped,
        Some(cwd),
        Some(task_id),
    )?;

    Ok(CliProcess {
        child,
        kind,
        prompt_file,
    })
}

/// Sends a feedback line to the child's stdin, if it still has one open.
/// Returns `false` if the backend has no stdin to write to (caller should
/// fall back to storing the message for the next resumption prompt).
pub async fn write_feedback_line(child: &mut Child, message: &str) -> bool {
    if let Some(stdin) = child.stdin.as_mut() {
        let mut line = message.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await.is_ok()
    } else {
        false
    }
}

/// Reads stdout lines from a CLI process, parsing each into an [`AgentEvent`]
/// and invoking `on_event` for it. Emits a synthetic [`AgentEvent::Heartbeat`]
/// if no line arrives within `heartbeat_every` (used for backends that buffer
/// everything until completion).
pub async fn pump_cli_output<F>(
    process: &mut CliProcess,
    heartbeat_every: Duration,
    mut on_event: F,
) -> Result<(), BackendError>
where
    F: FnMut(AgentEvent),
{
    let stdout = process
        .child
        .stdout
        .take()
        .ok_or_else(|| BackendError::Io(std::io::Error::other("no stdout pipe")))?;
    let mut reader = BufReader::new(stdout).lines();
    let mut accumulated = String::new();

    loop {
        let next = tokio::time::timeout(heartbeat_every, reader.next_line()).await;
        let line = match next {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(BackendError::Io(err)),
            Err(_) => {
                on_event(AgentEvent::Heartbeat);
                continue;
            }
        };

        let event = parse_line(process.kind, &line, &mut accumulated);
        if let AgentEvent::AssistantText { ref text } = event {
            accumulated.push_str(text);
        }
        on_event(event);
    }

    Ok(())
}

/// Parses one line of a CLI backend's streaming protocol into an
/// [`AgentEvent`]. Every known backend in this codebase speaks JSON-lines;
/// a line that doesn't parse as JSON is treated as raw assistant text.
fn parse_line(_kind: CliBackendKind, line: &str, accumulated: &str) -> AgentEvent {
    let line = line.trim();
    if line.is_empty() {
        return AgentEvent::Heartbeat;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return AgentEvent::AssistantText { text: line.to_string() },
    };

    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "assistant" | "text" | "message" => {
            let text = extract_text(&value).unwrap_or_default();
            AgentEvent::AssistantText { text }
        }
        "tool_use" | "tool_call" => {
            let name = value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string();
            let summary = value
                .get("input")
                .map(|v| v.to_string())
                .unwrap_or_default();
            AgentEvent::ToolCall { name, summary }
        }
        "tool_result" => {
            let name = value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string();
            let summary = extract_text(&value).unwrap_or_default();
            AgentEvent::ToolResult { name, summary }
        }
        "result" => {
            let text = extract_text(&value).unwrap_or_else(|| accumulated.to_string());
            AgentEvent::Completion { text }
        }
        "error" => {
            let subtype = value
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend reported an error")
                .to_string();
            if subtype == "turns-exhausted" || subtype == "turns_exhausted" {
                debug!("turns exhausted, falling back to accumulated text");
                AgentEvent::Completion {
                    text: accumulated.to_string(),
                }
            } else {
                AgentEvent::BackendError { subtype, message }
            }
        }
        other => {
            warn!(event_type = other, "unrecognized backend event type");
            AgentEvent::AssistantText {
                text: line.to_string(),
            }
        }
    }
}

fn extract_text(value: &Value) -> Option<String> {
    if let Some(s) = value.get("text").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    if let Some(s) = value.get("content").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    if let Some(arr) = value.get("content").and_then(Value::as_array) {
        let joined: String = arr
            .iter()
            .filter_map(|c| c.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    None
}

/// Hosted chat-completions call: a single request/response, no streaming.
pub struct HostedBackend {
    client: reqwest::Client,
}

impl Default for HostedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostedBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn complete(
        &self,
        provider: HostedProvider,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<AgentEvent, BackendError> {
        let (url, body) = request_shape(provider, model, prompt);
        let mut req = self.client.post(&url).json(&body);
        req = match provider {
            HostedProvider::Anthropic => req
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
            HostedProvider::OpenAi | HostedProvider::OpenRouter => {
                req.bearer_auth(api_key)
            }
        };

        let resp = req
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(BackendError::HostedStatus {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let value: Value = serde_json::from_str(&body_text)
            .map_err(|e| BackendError::Http(format!("invalid json response: {e}")))?;
        let text = extract_completion_text(provider, &value).unwrap_or_default();
        Ok(AgentEvent::Completion { text })
    }
}

fn request_shape(provider: HostedProvider, model: &str, prompt: &str) -> (String, Value) {
    match provider {
        HostedProvider::Anthropic => (
            "https://api.anthropic.com/v1/messages".to_string(),
            serde_json::json!({
                "model": model,
                "max_tokens": 8192,
                "messages": [{"role": "user", "content": prompt}],
            }),
        ),
        HostedProvider::OpenAi => (
            "https://api.openai.com/v1/chat/completions".to_string(),
            serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
            }),
        ),
        HostedProvider::OpenRouter => (
            "https://openrouter.ai/api/v1/chat/completions".to_string(),
            serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
            }),
        ),
    }
}

fn extract_completion_text(provider: HostedProvider, value: &Value) -> Option<String> {
    match provider {
        HostedProvider::Anthropic => value
            .get("content")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string),
        HostedProvider::OpenAi | HostedProvider::OpenRouter => value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}
