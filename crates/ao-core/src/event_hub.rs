//! Real-time, per-task fan-out of log lines, status transitions, and chat/
//! tool activity to many long-lived HTTP subscribers.
//!
//! The hub owns only ephemeral subscriber channels. Historical replay comes
//! from [`crate::task_store::TaskStore`] (which already persists every
//! [`crate::types::LogEntry`] and [`crate::types::ChatEvent`]) — the
//! orchestrator stitches the two together when a client connects: read the
//! backlog from the store, then subscribe here for everything published
//! after that read.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{ChatRole, LogLevel, TaskStatus};

/// How many consecutive failed (non-blocking) sends to a subscriber are
/// tolerated before the hub gives up on it and drops it from the list. A
/// dropped subscriber only misses live events; nothing is lost from the
/// persisted log/chat history it can always re-fetch from the store.
const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 3;

/// Default bound on the number of `log` records `TaskStore::log_tail`
/// replays to a freshly connected subscriber; see `DESIGN.md`.
pub const DEFAULT_LOG_BUFFER_CAPACITY: usize = 2_000;

/// One unit of per-task real-time information, named exactly as the wire
/// protocol names it (`event:` line value) via [`EventRecord::event_name`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventRecord {
    Log {
        task_id: Uuid,
        level: LogLevel,
        message: String,
        at: DateTime<Utc>,
    },
    Status {
        task_id: Uuid,
        status: TaskStatus,
        at: DateTime<Utc>,
    },
    ChatMessage {
        task_id: Uuid,
        role: ChatRole,
        text: String,
        at: DateTime<Utc>,
    },
    ToolActivity {
        task_id: Uuid,
        tool_name: String,
        summary: String,
        at: DateTime<Utc>,
    },
    TimeoutWarning {
        task_id: Uuid,
        running_since: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    },
    AwaitingReview {
        task_id: Uuid,
        message: String,
    },
    Complete {
        task_id: Uuid,
        pr_url: String,
    },
    Error {
        task_id: Uuid,
        message: String,
    },
}

impl EventRecord {
    /// The `event:` line value from the wire format contract.
    pub fn event_name(&self) -> &'static str {
        match self {
            EventRecord::Log { .. } => "log",
            EventRecord::Status { .. } => "status",
            EventRecord::ChatMessage { .. } => "chat_message",
            EventRecord::ToolActivity { .. } => "tool_activity",
            EventRecord::TimeoutWarning { .. } => "timeout_warning",
            EventRecord::AwaitingReview { .. } => "awaiting_review",
            EventRecord::Complete { .. } => "complete",
            EventRecord::Error { .. } => "error",
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            EventRecord::Log { task_id, .. }
            | EventRecord::Status { task_id, .. }
            | EventRecord::ChatMessage { task_id, .. }
            | EventRecord::ToolActivity { task_id, .. }
            | EventRecord::TimeoutWarning { task_id, .. }
            | EventRecord::AwaitingReview { task_id, .. }
            | EventRecord::Complete { task_id, .. }
            | EventRecord::Error { task_id, .. } => *task_id,
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<EventRecord>,
    consecutive_failures: u32,
}

#[derive(Default)]
struct TaskSubscribers(Vec<Subscriber>);

/// Registry of per-task subscriber lists, keyed by task id. One instance is
/// shared across the whole server (held by the `TaskOrchestrator`).
pub struct EventHub {
    tasks: DashMap<Uuid, Mutex<TaskSubscribers>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    fn publish(&self, record: EventRecord) {
        let entry = self.tasks.entry(record.task_id()).or_default();
        let mut guard = entry.lock().unwrap();
        guard.0.retain_mut(|sub| match sub.tx.try_send(record.clone()) {
            Ok(()) => {
                sub.consecutive_failures = 0;
                true
            }
            Err(_) => {
                sub.consecutive_failures += 1;
                sub.consecutive_failures < MAX_CONSECUTIVE_SEND_FAILURES
            }
        });
    }

    pub fn publish_log(&self, task_id: Uuid, level: LogLevel, message: impl Into<String>) {
        self.publish(EventRecord::Log {
            task_id,
            level,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn publish_status(&self, task_id: Uuid, status: TaskStatus) {
        self.publish(EventRecord::Status {
            task_id,
            status,
            at: Utc::now(),
        });
    }

    pub fn publish_chat_message(&self, task_id: Uuid, role: ChatRole, text: impl Into<String>) {
        self.publish(EventRecord::ChatMessage {
            task_id,
            role,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn publish_tool_activity(
        &self,
        task_id: Uuid,
        tool_name: impl Into<String>,
        summary: impl Into<String>,
    ) {
        self.publish(EventRecord::ToolActivity {
            task_id,
            tool_name: tool_name.into(),
            summary: summary.into(),
            at: Utc::now(),
        });
    }

    pub fn publish_timeout_warning(
        &self,
        task_id: Uuid,
        running_since: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    ) {
        self.publish(EventRecord::TimeoutWarning {
            task_id,
            running_since,
            timeout_at,
        });
    }

    pub fn publish_awaiting_review(&self, task_id: Uuid, message: impl Into<String>) {
        self.publish(EventRecord::AwaitingReview {
            task_id,
            message: message.into(),
        });
    }

    pub fn publish_complete(&self, task_id: Uuid, pr_url: impl Into<String>) {
        self.publish(EventRecord::Complete {
            task_id,
            pr_url: pr_url.into(),
        });
    }

    pub fn publish_error(&self, task_id: Uuid, message: impl Into<String>) {
        self.publish(EventRecord::Error {
            task_id,
            message: message.into(),
        });
    }

    /// Registers a new subscriber and returns a receiver for everything
    /// published from this point on. The channel is sized to comfortably
    /// hold a burst of live events without blocking the publisher; a
    /// subscriber that falls behind anyway is pruned (see
    /// [`MAX_CONSECUTIVE_SEND_FAILURES`]) rather than stalling the task.
    pub fn subscribe(&self, task_id: Uuid) -> mpsc::Receiver<EventRecord> {
        let entry = self.tasks.entry(task_id).or_default();
        let mut guard = entry.lock().unwrap();
        let (tx, rx) = mpsc::channel(256);
        guard.0.push(Subscriber {
            tx,
            consecutive_failures: 0,
        });
        rx
    }

    /// Number of live subscribers currently registered for a task. Exposed
    /// for tests and for operator-facing diagnostics.
    pub fn subscriber_count(&self, task_id: Uuid) -> usize {
        self.tasks
            .get(&task_id)
            .map(|entry| entry.lock().unwrap().0.len())
            .unwrap_or(0)
    }

    /// Drops the subscriber list for a task, called once it's deleted —
    /// any still-open SSE connections end naturally when their receiver is
    /// dropped from under them.
    pub fn forget(&self, task_id: Uuid) {
        self.tasks.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_live_events() {
        let hub = EventHub::new();
        let task_id = Uuid::new_v4();
        let mut rx = hub.subscribe(task_id);

        hub.publish_log(task_id, LogLevel::Info, "hello");
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EventRecord::Log { message, .. } if message == "hello"));
    }

    #[tokio::test]
    async fn events_for_other_tasks_are_not_delivered() {
        let hub = EventHub::new();
        let task_a = Uuid::new_v4();
        let task_b = Uuid::new_v4();
        let mut rx = hub.subscribe(task_a);

        hub.publish_log(task_b, LogLevel::Info, "not for you");
        hub.publish_log(task_a, LogLevel::Info, "for you");

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EventRecord::Log { message, .. } if message == "for you"));
    }

    #[tokio::test]
    async fn subscriber_count_reflects_active_subscriptions() {
        let hub = EventHub::new();
        let task_id = Uuid::new_v4();
        assert_eq!(hub.subscriber_count(task_id), 0);
        let _rx = hub.subscribe(task_id);
        assert_eq!(hub.subscriber_count(task_id), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_is_eventually_dropped() {
        let hub = EventHub::new();
        let task_id = Uuid::new_v4();
        let _rx = hub.subscribe(task_id); // never drained, channel fills up

        for i in 0..300 {
            hub.publish_log(task_id, LogLevel::Info, format!("line {i}"));
        }

        assert_eq!(hub.subscriber_count(task_id), 0);
    }

    #[tokio::test]
    async fn forget_removes_subscriber_list() {
        let hub = EventHub::new();
        let task_id = Uuid::new_v4();
        let _rx = hub.subscribe(task_id);
        hub.forget(task_id);
        assert_eq!(hub.subscriber_count(task_id), 0);
    }
}
