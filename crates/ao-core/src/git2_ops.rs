//! Native git read operations via libgit2 (git2 crate).
//!
//! Read-only queries (status, branch, diff) go through libgit2 in-process.
//! Write operations (worktree add, commit, push) stay as shell-outs in
//! [`crate::worktree_manager`].

use std::path::Path;

use crate::types::{DiffEntry, DiffStatus};

#[derive(Debug, thiserror::Error)]
pub enum GitOpsError {
    #[error("git error: {0}")]
    Git(String),
}

impl From<git2::Error> for GitOpsError {
    fn from(e: git2::Error) -> Self {
        GitOpsError::Git(e.message().to_string())
    }
}

/// Native git read operations using libgit2.
///
/// Stateless — opens the repo fresh for each call.
pub struct Git2ReadOps;

impl Git2ReadOps {
    fn open(workdir: &Path) -> Result<git2::Repository, GitOpsError> {
        git2::Repository::discover(workdir).map_err(GitOpsError::from)
    }

    /// Current branch name, or a short OID for a detached HEAD.
    pub fn current_branch(workdir: &Path) -> Result<String, GitOpsError> {
        let repo = Self::open(workdir)?;
        let head = repo.head()?;
        if let Some(name) = head.shorthand() {
            if name != "HEAD" {
                return Ok(name.to_string());
            }
        }
        let oid = head.target().ok_or_else(|| {
            GitOpsError::Git("HEAD has no target (unborn branch)".to_string())
        })?;
        Ok(oid.to_string()[..7].to_string())
    }

    /// Working-tree status relative to the index, mapped onto our closed
    /// `DiffStatus` vocabulary.
    pub fn status(workdir: &Path) -> Result<Vec<DiffEntry>, GitOpsError> {
        let repo = Self::open(workdir)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let statuses = repo.statuses(Some(&mut opts))?;
        let mut entries = Vec::new();
        for entry in statuses.iter() {
            let path = match entry.path() {
                Some(p) => p.to_string(),
                None => continue,
            };
            let flags = entry.status();
            let status = if flags.intersects(git2::Status::WT_NEW | git2::Status::INDEX_NEW) {
                DiffStatus::Added
            } else if flags.intersects(git2::Status::WT_DELETED | git2::Status::INDEX_DELETED) {
                DiffStatus::Deleted
            } else {
                DiffStatus::Modified
            };
            entries.push(DiffEntry {
                path,
                status,
                additions: 0,
                deletions: 0,
            });
        }
        Ok(entries)
    }

    /// Per-file add/delete counts and full unified patch text between two refs.
    ///
    /// The returned `String` is the concatenation of every patch line (with
    /// its `+`/`-`/` ` origin prefix) produced by libgit2 for the diff, i.e.
    /// the same text `git diff <from> <to>` would print.
    pub fn diff_unified(
        workdir: &Path,
        from_ref: &str,
        to_ref: &str,
    ) -> Result<(Vec<DiffEntry>, String), GitOpsError> {
        let repo = Self::open(workdir)?;

        let from_tree = repo.revparse_single(from_ref)?.peel_to_tree()?;
        let to_tree = repo.revparse_single(to_ref)?.peel_to_tree()?;
        let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?;

        let mut entries = Vec::new();
        for delta in diff.deltas() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();

            let status = match delta.status() {
                git2::Delta::Added => DiffStatus::Added,
                git2::Delta::Deleted => DiffStatus::Deleted,
                _ => DiffStatus::Modified,
            };

            entries.push(DiffEntry {
                path,
                status,
                additions: 0,
                deletions: 0,
            });
        }

        let mut line_stats: Vec<(u32, u32)> = vec![(0, 0); entries.len()];
        let mut patch_text = String::new();
        diff.print(git2::DiffFormat::Patch, |delta, _hunk, line| {
            let current_path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();

            match line.origin() {
                '+' | '-' | ' ' => patch_text.push(line.origin()),
                _ => {}
            }
            patch_text.push_str(&String::from_utf8_lossy(line.content()));

            if let Some(pos) = entries.iter().position(|e| e.path == current_path) {
                match line.origin() {
                    '+' => line_stats[pos].0 += 1,
                    '-' => line_stats[pos].1 += 1,
                    _ => {}
                }
            }
            true
        })?;

        for (entry, (adds, dels)) in entries.iter_mut().zip(line_stats.iter()) {
            entry.additions = *adds;
            entry.deletions = *dels;
        }

        Ok((entries, patch_text))
    }

    /// Fast check for whether `to_ref` has any changes relative to `from_ref`.
    pub fn has_changes_between(
        workdir: &Path,
        from_ref: &str,
        to_ref: &str,
    ) -> Result<bool, GitOpsError> {
        let repo = Self::open(workdir)?;
        let from_tree = repo.revparse_single(from_ref)?.peel_to_tree()?;
        let to_tree = repo.revparse_single(to_ref)?.peel_to_tree()?;
        let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?;
        Ok(diff.deltas().len() > 0)
    }

    /// Paths currently marked conflicted in the index (unmerged entries).
    pub fn conflict_files(workdir: &Path) -> Result<Vec<String>, GitOpsError> {
        let repo = Self::open(workdir)?;
        let index = repo.index()?;
        Ok(index
            .conflicts()?
            .filter_map(|c| c.ok())
            .filter_map(|c| {
                c.our
                    .or(c.their)
                    .or(c.ancestor)
                    .map(|e| String::from_utf8_lossy(&e.path).to_string())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_git(dir: &Path, args: &[&str]) {
        let out = std::process::Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .expect("git command should run");
        assert!(out.status.success());
    }

    fn init_fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        run_git(root, &["init"]);
        run_git(root, &["config", "user.email", "dev@example.com"]);
        run_git(root, &["config", "user.name", "Orchestrator"]);
        std::fs::write(root.join("a.txt"), "one\n").unwrap();
        run_git(root, &["add", "a.txt"]);
        run_git(root, &["commit", "-m", "base"]);
        run_git(root, &["branch", "-M", "main"]);
        run_git(root, &["checkout", "-b", "feature"]);
        std::fs::write(root.join("a.txt"), "one\ntwo\n").unwrap();
        run_git(root, &["commit", "-am", "feature change"]);
        tmp
    }

    #[test]
    fn diff_unified_contains_patch_text() {
        let tmp = init_fixture();
        let (entries, text) = Git2ReadOps::diff_unified(tmp.path(), "main", "feature").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].additions, 1);
        assert!(text.contains("+two"));
    }

    #[test]
    fn has_changes_between_detects_diff() {
        let tmp = init_fixture();
        assert!(Git2ReadOps::has_changes_between(tmp.path(), "main", "feature").unwrap());
        assert!(!Git2ReadOps::has_changes_between(tmp.path(), "main", "main").unwrap());
    }

    #[test]
    fn current_branch_reports_checked_out_branch() {
        let tmp = init_fixture();
        assert_eq!(Git2ReadOps::current_branch(tmp.path()).unwrap(), "feature");
    }
}
