use thiserror::Error;

/// Errors that can occur when performing read-only git operations.
#[derive(Debug, Error)]
pub enum GitReadError {
    /// A git command returned a non-zero exit code, the repository path is
    /// invalid, or the requested ref does not exist.
    #[error("git command failed: {0}")]
    Command(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Read-only git operations used by the diff/conflict query endpoints.
///
/// Intentionally narrow and excludes write operations (merge/push/worktree
/// add); those stay on [`crate::worktree_manager::GitRunner`].
pub trait GitReadAdapter: Send + Sync {
    fn current_branch(&self, repo_dir: &str) -> Result<String, GitReadError>;
    fn status_porcelain(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError>;
    fn diff_stat(&self, repo_dir: &str, base: &str, head: &str) -> Result<String, GitReadError>;
    /// Full unified patch text between `base` and `head`, suitable for
    /// direct display (the same text `git diff base head` would print).
    fn diff_unified(&self, repo_dir: &str, base: &str, head: &str)
        -> Result<String, GitReadError>;
    fn conflict_files(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError>;
}

/// Shell-based read adapter — the baseline implementation, always available.
pub struct ShellGitReadAdapter;

impl ShellGitReadAdapter {
    fn run_git(repo_dir: &str, args: &[&str]) -> Result<String, GitReadError> {
        let output = std::process::Command::new("git")
            .current_dir(repo_dir)
            .args(args)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8(output.stderr)
                .unwrap_or_else(|_| "git returned non-utf8 stderr".to_string());
            return Err(GitReadError::Command(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8(output.stdout)?;
        Ok(stdout.trim().to_string())
    }
}

impl GitReadAdapter for ShellGitReadAdapter {
    fn current_branch(&self, repo_dir: &str) -> Result<String, GitReadError> {
        Self::run_git(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn status_porcelain(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError> {
        let out = Self::run_git(repo_dir, &["status", "--porcelain"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn diff_stat(&self, repo_dir: &str, base: &str, head: &str) -> Result<String, GitReadError> {
        Self::run_git(repo_dir, &["diff", "--stat", base, head])
    }

    fn diff_unified(
        &self,
        repo_dir: &str,
        base: &str,
        head: &str,
    ) -> Result<String, GitReadError> {
        let output = std::process::Command::new("git")
            .current_dir(repo_dir)
            .args(["diff", base, head])
            .output()?;
        // `git diff` exits 0 even with differences; non-zero means a real error.
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(GitReadError::Command(stderr.trim().to_string()));
        }
        Ok(String::from_utf8(output.stdout)?)
    }

    fn conflict_files(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError> {
        let out = Self::run_git(repo_dir, &["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// git2-based read adapter (feature-gated)
// ---------------------------------------------------------------------------

/// Native libgit2 read adapter. Avoids a process spawn per query.
#[cfg(feature = "libgit2")]
pub struct Git2ReadAdapter;

#[cfg(feature = "libgit2")]
impl GitReadAdapter for Git2ReadAdapter {
    fn current_branch(&self, repo_dir: &str) -> Result<String, GitReadError> {
        crate::git2_ops::Git2ReadOps::current_branch(std::path::Path::new(repo_dir))
            .map_err(|e| GitReadError::Command(e.to_string()))
    }

    fn status_porcelain(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError> {
        let entries = crate::git2_ops::Git2ReadOps::status(std::path::Path::new(repo_dir))
            .map_err(|e| GitReadError::Command(e.to_string()))?;

        Ok(entries
            .iter()
            .map(|e| {
                let prefix = match e.status {
                    crate::types::DiffStatus::Modified => "M ",
                    crate::types::DiffStatus::Added => "A ",
                    crate::types::DiffStatus::Deleted => "D ",
                };
                format!("{} {}", prefix, e.path)
            })
            .collect())
    }

    fn diff_stat(&self, repo_dir: &str, base: &str, head: &str) -> Result<String, GitReadError> {
        let (entries, _) = crate::git2_ops::Git2ReadOps::diff_unified(
            std::path::Path::new(repo_dir),
            base,
            head,
        )
        .map_err(|e| GitReadError::Command(e.to_string()))?;

        if entries.is_empty() {
            return Ok(String::new());
        }

        let mut lines = Vec::with_capacity(entries.len() + 1);
        let mut total_adds = 0u32;
        let mut total_dels = 0u32;
        for entry in &entries {
            let changes = entry.additions + entry.deletions;
            let plus = "+".repeat(entry.additions as usize);
            let minus = "-".repeat(entry.deletions as usize);
            lines.push(format!(" {} | {} {}{}", entry.path, changes, plus, minus));
            total_adds += entry.additions;
            total_dels += entry.deletions;
        }
        lines.push(format!(
            " {} files changed, {} insertions(+), {} deletions(-)",
            entries.len(),
            total_adds,
            total_dels,
        ));
        Ok(lines.join("\n"))
    }

    fn diff_unified(
        &self,
        repo_dir: &str,
        base: &str,
        head: &str,
    ) -> Result<String, GitReadError> {
        let (_, text) = crate::git2_ops::Git2ReadOps::diff_unified(
            std::path::Path::new(repo_dir),
            base,
            head,
        )
        .map_err(|e| GitReadError::Command(e.to_string()))?;
        Ok(text)
    }

    fn conflict_files(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError> {
        crate::git2_ops::Git2ReadOps::conflict_files(std::path::Path::new(repo_dir))
            .map_err(|e| GitReadError::Command(e.to_string()))
    }
}

/// Create the best available read adapter for the current build.
pub fn default_read_adapter() -> Box<dyn GitReadAdapter> {
    #[cfg(feature = "libgit2")]
    {
        Box::new(Git2ReadAdapter)
    }
    #[cfg(not(feature = "libgit2"))]
    {
        Box::new(ShellGitReadAdapter)
    }
}
