//! Async SQLite-backed persistence for tasks, chat events, and log entries.
//! Tasks are stored as a row of scalar columns for the fields the store
//! needs to query by (status, repo) plus a JSON blob for the rest, mirroring
//! how this codebase persists other structured-but-evolving records.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{ChatEvent, LogEntry, LogLevel, Task, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("task {0} not found")]
    NotFound(Uuid),
}

type Result<T> = std::result::Result<T, TaskStoreError>;

pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id         TEXT PRIMARY KEY,
                        status     TEXT NOT NULL,
                        repo_url   TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        data       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

                    CREATE TABLE IF NOT EXISTS chat_events (
                        id         TEXT PRIMARY KEY,
                        task_id    TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        data       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_chat_events_task ON chat_events(task_id);

                    CREATE TABLE IF NOT EXISTS log_entries (
                        id         TEXT PRIMARY KEY,
                        task_id    TEXT NOT NULL,
                        level      TEXT NOT NULL,
                        message    TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_log_entries_task ON log_entries(task_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn upsert_task(&self, task: &Task) -> Result<()> {
        let id = task.id.to_string();
        let status = task.status.to_string();
        let repo_url = task.repo_url.clone();
        let created_at = task.created_at.to_rfc3339();
        let updated_at = task.updated_at.to_rfc3339();
        let data = serde_json::to_string(task)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, status, repo_url, created_at, updated_at, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        status=excluded.status, repo_url=excluded.repo_url,
                        updated_at=excluded.updated_at, data=excluded.data",
                    rusqlite::params![id, status, repo_url, created_at, updated_at, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let id_str = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM tasks WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    pub async fn require_task(&self, id: Uuid) -> Result<Task> {
        self.get_task(id).await?.ok_or(TaskStoreError::NotFound(id))
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let status_filter = status.map(|s| s.to_string());
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut tasks = Vec::new();
                match &status_filter {
                    Some(status) => {
                        let mut stmt =
                            conn.prepare("SELECT data FROM tasks WHERE status = ?1 ORDER BY created_at")?;
                        let mut rows = stmt.query(rusqlite::params![status])?;
                        while let Some(row) = rows.next()? {
                            tasks.push(row.get::<_, String>(0)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare("SELECT data FROM tasks ORDER BY created_at")?;
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            tasks.push(row.get::<_, String>(0)?);
                        }
                    }
                }
                Ok(tasks)
            })
            .await?;
        rows.into_iter()
            .map(|json| serde_json::from_str(&json).map_err(TaskStoreError::from))
            .collect()
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id_str])?;
                conn.execute(
                    "DELETE FROM chat_events WHERE task_id = ?1",
                    rusqlite::params![id_str],
                )?;
                conn.execute(
                    "DELETE FROM log_entries WHERE task_id = ?1",
                    rusqlite::params![id_str],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn append_chat_event(&self, event: &ChatEvent) -> Result<()> {
        let id = match event {
            ChatEvent::Message { id, .. } => *id,
            ChatEvent::ToolActivity { id, .. } => *id,
        }
        .to_string();
        let task_id = event.task_id().to_string();
        let created_at = Utc::now().to_rfc3339();
        let data = serde_json::to_string(event)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO chat_events (id, task_id, created_at, data) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, task_id, created_at, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn chat_history(&self, task_id: Uuid) -> Result<Vec<ChatEvent>> {
        let task_id_str = task_id.to_string();
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT data FROM chat_events WHERE task_id = ?1 ORDER BY created_at")?;
                let mut rows = stmt.query(rusqlite::params![task_id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;
        rows.into_iter()
            .map(|json| serde_json::from_str(&json).map_err(TaskStoreError::from))
            .collect()
    }

    pub async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let id = entry.id.to_string();
        let task_id = entry.task_id.to_string();
        let level = level_to_str(entry.level).to_string();
        let message = entry.message.clone();
        let created_at = entry.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO log_entries (id, task_id, level, message, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, task_id, level, message, created_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn log_tail(&self, task_id: Uuid, limit: usize) -> Result<Vec<LogEntry>> {
        let task_id_str = task_id.to_string();
        let rows: Vec<(String, String, String, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, level, message, created_at FROM log_entries
                     WHERE task_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![task_id_str, limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ));
                }
                Ok(out)
            })
            .await?;

        let mut entries: Vec<LogEntry> = rows
            .into_iter()
            .filter_map(|(id, task_id, level, message, created_at)| {
                Some(LogEntry {
                    id: Uuid::parse_str(&id).ok()?,
                    task_id: Uuid::parse_str(&task_id).ok()?,
                    level: level_from_str(&level),
                    message,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .ok()?
                        .with_timezone(&Utc),
                })
            })
            .collect();
        entries.reverse();
        Ok(entries)
    }
}

fn level_to_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
        LogLevel::Agent => "agent",
        LogLevel::User => "user",
    }
}

fn level_from_str(s: &str) -> LogLevel {
    match s {
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        "agent" => LogLevel::Agent,
        "user" => LogLevel::User,
        _ => LogLevel::Info,
    }
}
