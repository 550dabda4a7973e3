//! Composition root for the orchestration server: wires storage, the git
//! worktree manager, the agent runner, the event hub, and the HTTP router
//! into one running process.

pub mod daemon;
