//! Cross-platform process spawning and tree-kill, with a pid-keyed registry
//! so the orchestrator can kill or query agent processes without threading
//! `Child` handles through every layer that might need to stop one.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::process::{Child, Command};
use tracing::{info, warn};
use uuid::Uuid;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no process registered with pid {0}")]
    NotFound(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Piped,
    Null,
    Inherit,
}

impl StdioMode {
    fn build(self) -> Stdio {
        match self {
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Null => Stdio::null(),
            StdioMode::Inherit => Stdio::inherit(),
        }
    }
}

#[derive(Debug, Clone)]
struct ProcessRecord {
    task_id: Option<Uuid>,
    program: String,
    #[allow(dead_code)]
    args: Vec<String>,
}

/// Tracks every process the orchestrator has spawned, keyed by OS pid, with
/// an optional task-id association so a task's agent process can be found
/// and killed without the caller keeping its own bookkeeping.
#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: Arc<DashMap<u32, ProcessRecord>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(DashMap::new()),
        }
    }

    /// Spawn `program` with `args`, optionally associating it with `task_id`.
    /// On Unix the child is placed in its own process group so
    /// [`ProcessSupervisor::tree_kill`] can signal the whole subtree at once.
    pub fn spawn(
        &self,
        program: &str,
        args: &[String],
        stdin: StdioMode,
        stdout: StdioMode,
        stderr: StdioMode,
        cwd: Option<&str>,
        task_id: Option<Uuid>,
    ) -> Result<Child, SupervisorError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(stdin.build())
            .stdout(stdout.build())
            .stderr(stderr.build())
            .kill_on_drop(false);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.to_string(),
            source,
        })?;

        if let Some(pid) = child.id() {
            self.registry.insert(
                pid,
                ProcessRecord {
                    task_id,
                    program: program.to_string(),
                    args: args.to_vec(),
                },
            );
            info!(pid, program, ?task_id, "spawned process");
        }

        Ok(child)
    }

    /// Forget a pid (call once the `Child` handle has been awaited/reaped).
    pub fn deregister(&self, pid: u32) {
        self.registry.remove(&pid);
    }

    /// Kill the process group rooted at `pid`. Tolerates "already gone" as
    /// success, since the common case is a process that exited on its own
    /// right before this call landed.
    pub fn tree_kill(&self, pid: u32) -> Result<(), SupervisorError> {
        #[cfg(unix)]
        {
            unsafe {
                // Negative pid targets the whole process group created via
                // setsid() above.
                let result = libc::kill(-(pid as i32), libc::SIGTERM);
                if result != 0 {
                    let errno = std::io::Error::last_os_error();
                    if errno.raw_os_error() != Some(libc::ESRCH) {
                        warn!(pid, error = %errno, "SIGTERM failed, trying SIGKILL");
                        let _ = libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
            }
        }
        #[cfg(windows)]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output();
        }

        self.registry.remove(&pid);
        Ok(())
    }

    /// Kill every registered process associated with `task_id`.
    pub fn kill_for_task(&self, task_id: Uuid) {
        let pids: Vec<u32> = self
            .registry
            .iter()
            .filter(|entry| entry.value().task_id == Some(task_id))
            .map(|entry| *entry.key())
            .collect();
        for pid in pids {
            let _ = self.tree_kill(pid);
        }
    }

    /// Snapshot of currently-tracked pids, for diagnostics.
    pub fn active_processes(&self) -> HashMap<u32, Option<Uuid>> {
        self.registry
            .iter()
            .map(|entry| (*entry.key(), entry.value().task_id))
            .collect()
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.registry.contains_key(&pid)
    }
}
