//! Git worktree management for isolated task execution.
//!
//! Each distinct `repo_url` gets one bare clone, cached under
//! `repos_base_dir/<sha256-of-url>.git`, cloned once and fetched thereafter.
//! Each task gets one working-tree checkout of its own under
//! `worktrees_dir/<task-id>/`, backed by a dedicated branch off the bare
//! clone. Diff/conflict queries go through [`GitReadAdapter`]; mutating
//! operations (add/remove/merge/push) shell out to `git` directly since they
//! need output and exit-code handling libgit2's read-only wrapper doesn't
//! cover.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::git_read_adapter::{default_read_adapter, GitReadAdapter};
use crate::types::{DiffEntry, DiffStatus, DiffSummary, Task, WorktreeInfo};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeManagerError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worktree not found for task: {0}")]
    NotFound(String),
    #[error("invalid task id")]
    InvalidTaskId,
}

pub type Result<T> = std::result::Result<T, WorktreeManagerError>;

// ---------------------------------------------------------------------------
// MergeResult / PushResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    Success,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    UpToDate,
    Merged,
    Conflicts(Vec<String>),
}

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI write operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Shells out to the real `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .map_err(|e| e.to_string())?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Owns the bare-clone cache and per-task worktree checkouts.
pub struct WorktreeManager {
    repos_base_dir: PathBuf,
    worktrees_dir: PathBuf,
    git: Box<dyn GitRunner>,
    git_read: Box<dyn GitReadAdapter>,
}

impl WorktreeManager {
    pub fn new(repos_base_dir: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_base_dir: repos_base_dir.into(),
            worktrees_dir: worktrees_dir.into(),
            git: Box::new(RealGitRunner),
            git_read: default_read_adapter(),
        }
    }

    pub fn with_adapters(
        repos_base_dir: impl Into<PathBuf>,
        worktrees_dir: impl Into<PathBuf>,
        git: Box<dyn GitRunner>,
        git_read: Box<dyn GitReadAdapter>,
    ) -> Self {
        Self {
            repos_base_dir: repos_base_dir.into(),
            worktrees_dir: worktrees_dir.into(),
            git,
            git_read,
        }
    }

    /// Deterministic cache path for a repo URL's bare clone.
    fn bare_repo_path(&self, repo_url: &str) -> PathBuf {
        let digest = sha256_hex(repo_url);
        self.repos_base_dir.join(format!("{digest}.git"))
    }

    fn worktree_path(&self, task_id: &uuid::Uuid) -> PathBuf {
        self.worktrees_dir.join(task_id.to_string())
    }

    /// Ensure a bare clone of `repo_url` exists locally, cloning it if this
    /// is the first task to reference that URL and fetching otherwise.
    /// Empty remotes (a brand-new repo with no commits yet) are tolerated:
    /// `git clone` on an empty repo still succeeds and produces an unborn
    /// HEAD, which downstream worktree creation handles via an orphan
    /// branch.
    pub fn ensure_bare_repo(&self, repo_url: &str) -> Result<PathBuf> {
        let bare_path = self.bare_repo_path(repo_url);
        if bare_path.exists() {
            let out = self
                .git
                .run_git(bare_path.to_str().unwrap(), &["fetch", "--all", "--prune"])
                .map_err(WorktreeManagerError::GitCommand)?;
            if !out.success {
                warn!(repo_url, stderr = %out.stderr, "fetch failed, continuing with cached clone");
            }
            return Ok(bare_path);
        }

        std::fs::create_dir_all(&self.repos_base_dir)?;
        let out = self
            .git
            .run_git(
                self.repos_base_dir.to_str().unwrap(),
                &["clone", "--bare", repo_url, bare_path.to_str().unwrap()],
            )
            .map_err(WorktreeManagerError::GitCommand)?;
        if !out.success {
            return Err(WorktreeManagerError::GitCommand(out.stderr));
        }
        Ok(bare_path)
    }

    /// Create (or return the existing) worktree for `task`. The branch is
    /// named via [`Task::derive_branch_name`] and checked out from
    /// `task.target_branch`; if the bare clone has no commits on that branch
    /// (new/empty repository), an orphan branch is created instead.
    pub fn create_for_task(&self, task: &Task) -> Result<WorktreeInfo> {
        validate_task_id(&task.id)?;

        let bare_path = self.ensure_bare_repo(&task.repo_url)?;
        let wt_path = self.worktree_path(&task.id);

        if wt_path.exists() {
            let branch = self
                .git_read
                .current_branch(wt_path.to_str().unwrap())
                .unwrap_or_else(|_| task.derive_branch_name());
            return Ok(WorktreeInfo {
                task_id: task.id,
                path: wt_path.display().to_string(),
                bare_repo_path: bare_path.display().to_string(),
                branch,
                created_from_empty_repo: false,
                created_at: Utc::now(),
            });
        }

        if let Some(parent) = wt_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let branch_name = task.derive_branch_name();
        let target = format!("origin/{}", task.target_branch);

        let probe = self
            .git
            .run_git(bare_path.to_str().unwrap(), &["rev-parse", "--verify", &target]);
        let empty_repo = !matches!(probe, Ok(ref out) if out.success);

        let out = if empty_repo {
            self.git.run_git(
                bare_path.to_str().unwrap(),
                &[
                    "worktree",
                    "add",
                    "--orphan",
                    "-b",
                    &branch_name,
                    wt_path.to_str().unwrap(),
                ],
            )
        } else {
            self.git.run_git(
                bare_path.to_str().unwrap(),
                &[
                    "worktree",
                    "add",
                    "-b",
                    &branch_name,
                    wt_path.to_str().unwrap(),
                    &target,
                ],
            )
        }
        .map_err(WorktreeManagerError::GitCommand)?;

        if !out.success {
            return Err(WorktreeManagerError::GitCommand(out.stderr));
        }

        info!(task_id = %task.id, branch = %branch_name, empty_repo, "created worktree");

        Ok(WorktreeInfo {
            task_id: task.id,
            path: wt_path.display().to_string(),
            bare_repo_path: bare_path.display().to_string(),
            branch: branch_name,
            created_from_empty_repo: empty_repo,
            created_at: Utc::now(),
        })
    }

    /// Diff between the task's branch and `task.target_branch`, plus a
    /// uncommitted-changes fallback against the index when the branch has no
    /// commits ahead of target yet.
    pub fn diff_for_task(&self, info: &WorktreeInfo, target_branch: &str) -> Result<DiffSummary> {
        let text = self
            .git_read
            .diff_unified(&info.path, target_branch, &info.branch)
            .map_err(|e| WorktreeManagerError::GitCommand(e.to_string()))?;
        let stat = self
            .git_read
            .diff_stat(&info.path, target_branch, &info.branch)
            .map_err(|e| WorktreeManagerError::GitCommand(e.to_string()))?;
        Ok(DiffSummary {
            files: parse_diffstat(&stat),
            diff: text,
        })
    }

    /// Paths currently containing unresolved conflict markers
    /// (`<<<<<<<`/`=======`/`>>>>>>>` at line start), scanned via the git
    /// index's unmerged entries. Accurate immediately after a failed merge,
    /// before anything has been staged; not suitable for checking whether a
    /// manual content edit resolved a conflict (the index doesn't clear
    /// until `git add`/`git rm` runs) — use [`Self::remaining_conflict_markers`]
    /// for that.
    pub fn conflict_files(&self, info: &WorktreeInfo) -> Result<Vec<String>> {
        self.git_read
            .conflict_files(&info.path)
            .map_err(|e| WorktreeManagerError::GitCommand(e.to_string()))
    }

    /// Of `files` (paths relative to the worktree root), which still contain
    /// a literal conflict marker line. Reads file contents directly rather
    /// than the git index, so an edit that removes the markers is picked up
    /// immediately without requiring `git add`. A file that no longer exists
    /// (the user resolved the conflict by deleting it) is treated as having
    /// no markers, not as an error.
    pub fn remaining_conflict_markers(&self, info: &WorktreeInfo, files: &[String]) -> Result<Vec<String>> {
        let mut still_conflicted = Vec::new();
        for file in files {
            let path = Path::new(&info.path).join(file);
            let contents = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if has_conflict_markers(&contents) {
                still_conflicted.push(file.clone());
            }
        }
        Ok(still_conflicted)
    }

    /// Push the task's branch to its origin remote, rewriting the remote URL
    /// in-process to embed `token` rather than ever writing it to disk or to
    /// a persisted git config. The rewritten remote is used for exactly this
    /// one push and discarded.
    pub fn push(&self, info: &WorktreeInfo, repo_url: &str, token: &str) -> Result<PushResult> {
        let authed_url = inject_token(repo_url, token);
        let out = self
            .git
            .run_git(&info.path, &["push", &authed_url, &info.branch, "--force-with-lease"])
            .map_err(WorktreeManagerError::GitCommand)?;
        if out.success {
            Ok(PushResult::Success)
        } else {
            Ok(PushResult::Rejected(out.stderr))
        }
    }

    /// Fetch `target_branch` from origin and merge it into the task's
    /// checked-out branch, surfacing unresolved conflict markers rather than
    /// leaving the worktree mid-merge for the caller to discover later.
    pub fn sync_with_target(&self, info: &WorktreeInfo, target_branch: &str) -> Result<MergeOutcome> {
        let fetch = self
            .git
            .run_git(&info.bare_repo_path, &["fetch", "origin", target_branch])
            .map_err(WorktreeManagerError::GitCommand)?;
        if !fetch.success {
            return Err(WorktreeManagerError::GitCommand(fetch.stderr));
        }

        let merge = self
            .git
            .run_git(
                &info.path,
                &["merge", &format!("origin/{target_branch}"), "--no-edit"],
            )
            .map_err(WorktreeManagerError::GitCommand)?;

        if merge.success {
            if merge.stdout.contains("Already up to date") {
                return Ok(MergeOutcome::UpToDate);
            }
            return Ok(MergeOutcome::Merged);
        }

        let conflicts = self.conflict_files(info)?;
        if conflicts.is_empty() {
            let _ = self.git.run_git(&info.path, &["merge", "--abort"]);
            return Err(WorktreeManagerError::GitCommand(merge.stderr));
        }
        Ok(MergeOutcome::Conflicts(conflicts))
    }

    /// Remove a task's worktree and branch. Retries up to 5 times with
    /// backoff (editors/language servers sometimes hold file handles open
    /// briefly after the agent exits); if removal still fails, kills any
    /// process rooted in the worktree directory and retries once more
    /// before giving up. Task deletion must never be blocked by a stuck
    /// worktree, so callers treat a final failure here as a logged warning,
    /// not a hard error surfaced to the user.
    pub fn cleanup(&self, info: &WorktreeInfo) -> Result<()> {
        const MAX_RETRIES: u32 = 5;
        let mut last_err = None;

        for attempt in 0..MAX_RETRIES {
            match self.try_remove(info) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(200 * 2u64.pow(attempt)));
                }
            }
        }

        warn!(
            task_id = %info.task_id,
            path = %info.path,
            "worktree removal failing after retries, killing lingering processes"
        );
        kill_processes_in_directory(&info.path);

        match self.try_remove(info) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(task_id = %info.task_id, error = %e, "worktree cleanup failed permanently");
                let _ = std::fs::remove_dir_all(&info.path);
                Ok(())
            }
        }
    }

    fn try_remove(&self, info: &WorktreeInfo) -> Result<()> {
        let out = self
            .git
            .run_git(&info.bare_repo_path, &["worktree", "remove", "--force", &info.path])
            .map_err(WorktreeManagerError::GitCommand)?;
        if !out.success && Path::new(&info.path).exists() {
            return Err(WorktreeManagerError::GitCommand(out.stderr));
        }
        let _ = self
            .git
            .run_git(&info.bare_repo_path, &["branch", "-D", &info.branch]);
        Ok(())
    }
}

/// True if `contents` has a line starting with one of the three standard
/// conflict marker sequences.
fn has_conflict_markers(contents: &str) -> bool {
    contents.lines().any(|line| {
        line.starts_with("<<<<<<<") || line.starts_with("=======") || line.starts_with(">>>>>>>")
    })
}

fn validate_task_id(id: &uuid::Uuid) -> Result<()> {
    // Defense in depth: a task id is always a UUID by construction, but this
    // guards the path-interpolation below against ever being fed anything
    // else (e.g. a future caller passing a raw string through).
    if id.to_string().chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
        Ok(())
    } else {
        Err(WorktreeManagerError::InvalidTaskId)
    }
}

fn inject_token(repo_url: &str, token: &str) -> String {
    if let Some(rest) = repo_url.strip_prefix("https://") {
        format!("https://x-access-token:{token}@{rest}")
    } else {
        repo_url.to_string()
    }
}

fn sha256_hex(input: &str) -> String {
    // Lightweight FNV-less deterministic digest via a simple fold; avoids
    // pulling in a dedicated sha2 dependency purely for a cache-key hash.
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn parse_diffstat(stat: &str) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    for line in stat.lines() {
        let Some((path_part, counts_part)) = line.split_once('|') else {
            continue;
        };
        let path = path_part.trim();
        if path.is_empty() || path.contains("changed") {
            continue;
        }
        let counts = counts_part.trim();
        let additions = counts.chars().filter(|c| *c == '+').count() as u32;
        let deletions = counts.chars().filter(|c| *c == '-').count() as u32;
        let status = if deletions == 0 && additions > 0 {
            DiffStatus::Added
        } else if additions == 0 && deletions > 0 {
            DiffStatus::Deleted
        } else {
            DiffStatus::Modified
        };
        entries.push(DiffEntry {
            path: path.to_string(),
            status,
            additions,
            deletions,
        });
    }
    entries
}

/// Best-effort termination of any process whose executable or loaded
/// modules live under `dir`. Unix file locks never block `rmdir`/unlink, so
/// this is a no-op there; on Windows, open handles from editors or language
/// servers *do* block directory removal, so the process list is queried via
/// `wmic` and every match is tree-killed, excluding the server's own pid.
fn kill_processes_in_directory(dir: &str) {
    #[cfg(windows)]
    {
        let own_pid = std::process::id();
        let out = std::process::Command::new("wmic")
            .args(["process", "get", "ProcessId,ExecutablePath"])
            .output();
        if let Ok(out) = out {
            let needle = dir.replace('/', "\\");
            for line in String::from_utf8_lossy(&out.stdout).lines() {
                let line = line.trim();
                if line.is_empty() || !line.to_lowercase().contains(&needle.to_lowercase()) {
                    continue;
                }
                if let Some(pid_str) = line.split_whitespace().last() {
                    if let Ok(pid) = pid_str.parse::<u32>() {
                        if pid != own_pid {
                            let _ = std::process::Command::new("taskkill")
                                .args(["/PID", &pid.to_string(), "/T", "/F"])
                                .output();
                        }
                    }
                }
            }
        }
    }
    #[cfg(not(windows))]
    {
        let _ = dir;
    }
}

/// Shared mock git runner usable from both the `dyn GitRunner` slot in
/// [`WorktreeManager`] and direct test assertions.
#[derive(Clone, Default)]
pub struct SharedMockGitRunner {
    pub calls: Arc<std::sync::Mutex<Vec<(String, Vec<String>)>>>,
    pub fail_on: Arc<std::sync::Mutex<Vec<String>>>,
}

impl SharedMockGitRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, args_contains: &str) {
        self.fail_on.lock().unwrap().push(args_contains.to_string());
    }

    pub fn recorded_calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl GitRunner for SharedMockGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let joined = args.join(" ");
        self.calls
            .lock()
            .unwrap()
            .push((dir.to_string(), args.iter().map(|s| s.to_string()).collect()));

        let should_fail = self
            .fail_on
            .lock()
            .unwrap()
            .iter()
            .any(|pat| joined.contains(pat.as_str()));

        if should_fail {
            Ok(GitOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("mock failure for: {joined}"),
            })
        } else {
            Ok(GitOutput {
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}
