//! Builds the text handed to a backend for each mode a task can run in:
//! spec generation, plan/execute, and resumption with prior chat history.

use ao_core::types::{ChatEvent, ChatRole, Task};

/// Builds the prompt for turning free-text task input into a generated
/// specification.
pub fn spec_generation_prompt(task: &Task) -> String {
    let mut out = String::new();
    out.push_str("You are generating a precise engineering specification from a task request.\n\n");
    out.push_str(&format!("Title: {}\n", task.title));
    if !task.description.is_empty() {
        out.push_str(&format!("Description: {}\n", task.description));
    }
    out.push_str(&format!("Request:\n{}\n\n", task.user_input));
    if !task.context_files.is_empty() {
        out.push_str("Relevant files:\n");
        for file in &task.context_files {
            out.push_str(&format!("- {file}\n"));
        }
        out.push('\n');
    }
    out.push_str(
        "Produce a clear specification of what should change, the scope boundaries, \
         and any open questions. Do not write code.",
    );
    out
}

/// Builds the prompt for the planning step: ask the agent for an
/// implementation plan against the approved specification, without writing
/// any code yet. The plan text becomes `Task::plan`, reviewed by the user
/// before the real execute run starts.
pub fn plan_prompt(task: &Task) -> String {
    let mut out = String::new();
    out.push_str(
        "Before writing any code, produce a short implementation plan for the \
         following approved specification: the files you expect to touch, the \
         order of changes, and how you will verify the result. Do not write or \
         modify any files yet.\n\n",
    );
    let spec = task
        .final_specification
        .as_deref()
        .or(task.generated_spec.as_deref())
        .unwrap_or(&task.user_input);
    out.push_str(&format!("Specification:\n{spec}\n\n"));
    if !task.context_files.is_empty() {
        out.push_str("Relevant files:\n");
        for file in &task.context_files {
            out.push_str(&format!("- {file}\n"));
        }
        out.push('\n');
    }
    out
}

/// Builds the prompt for the execute mode: an approved specification driven
/// against a checked-out worktree.
pub fn execute_prompt(task: &Task) -> String {
    let mut out = String::new();
    out.push_str("Implement the following approved specification in this repository.\n\n");
    let spec = task
        .final_specification
        .as_deref()
        .or(task.generated_spec.as_deref())
        .unwrap_or(&task.user_input);
    out.push_str(&format!("Specification:\n{spec}\n\n"));
    if let Some(plan) = &task.plan {
        out.push_str(&format!("Agreed plan:\n{plan}\n\n"));
    }
    if let Some(build) = &task.build_command {
        out.push_str(&format!("Build/verify with: {build}\n\n"));
    }
    if !task.context_files.is_empty() {
        out.push_str("Relevant files:\n");
        for file in &task.context_files {
            out.push_str(&format!("- {file}\n"));
        }
        out.push('\n');
    }
    out.push_str("Work directly in the checked-out branch and leave the changes uncommitted-but-staged for review.");
    out
}

/// Builds a resume prompt: the prior chat history plus a new feedback
/// message, used when feedback arrives while the agent is idle.
pub fn resume_prompt(task: &Task, history: &[ChatEvent], feedback: &str) -> String {
    let mut out = String::new();
    out.push_str("Continuing work on this task. Prior conversation:\n\n");
    for event in history {
        if let ChatEvent::Message { role, text, .. } = event {
            let label = match role {
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
                ChatRole::System => "System",
            };
            out.push_str(&format!("{label}: {text}\n"));
        }
    }
    out.push_str(&format!("\nNew feedback from the user:\n{feedback}\n\n"));
    out.push_str("Incorporate this feedback and continue the work.");
    out
}
