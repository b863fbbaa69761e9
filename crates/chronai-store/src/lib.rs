//! chronai-store: SQLite persistence for tasks and execution logs.
//!
//! Every operation takes the connection for one short-lived statement and
//! commits independently; nothing holds the store across an outbound call.
//! Execution logs are owned by their task via `ON DELETE CASCADE`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use chronai_types::{ExecutionLog, ExecutionStatus, NewExecutionLog, NewTask, ScheduleType, Task};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        api_endpoint TEXT NOT NULL,
        api_key TEXT NOT NULL,
        schedule_type TEXT NOT NULL,
        interval_minutes INTEGER,
        interval_seconds INTEGER,
        fixed_time TEXT,
        message_content TEXT NOT NULL,
        model TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS execution_logs (
        id INTEGER PRIMARY KEY,
        task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        executed_at TEXT NOT NULL,
        status TEXT NOT NULL,
        response_summary TEXT,
        error_message TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_execution_logs_task
        ON execution_logs(task_id, executed_at DESC);";

/// SQLite-backed task store.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Task store opened: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─── Tasks ───────────────────────────────────

    /// Insert a new task; timestamps are assigned here, not by SQLite.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO tasks
                    (name, api_endpoint, api_key, schedule_type, interval_minutes,
                     interval_seconds, fixed_time, message_content, model, enabled,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    new.name,
                    new.api_endpoint,
                    new.api_key,
                    new.schedule_type.as_str(),
                    new.interval_minutes,
                    new.interval_seconds,
                    new.fixed_time,
                    new.message_content,
                    new.model,
                    new.enabled as i64,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(Task {
                id,
                name: new.name,
                api_endpoint: new.api_endpoint,
                api_key: new.api_key,
                schedule_type: new.schedule_type,
                interval_minutes: new.interval_minutes,
                interval_seconds: new.interval_seconds,
                fixed_time: new.fixed_time,
                message_content: new.message_content,
                model: new.model,
                enabled: new.enabled,
                created_at: now,
                updated_at: now,
            })
        })
        .await?
    }

    /// Get a task by id.
    pub async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"
            ))?;
            match stmt.query_row(rusqlite::params![id], task_from_row) {
                Ok(task) => Ok(Some(task)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    /// List every task, oldest first.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.query_tasks(format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))
            .await
    }

    /// List tasks with `enabled = true`, oldest first.
    pub async fn list_enabled_tasks(&self) -> Result<Vec<Task>> {
        self.query_tasks(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE enabled = 1 ORDER BY id"
        ))
        .await
    }

    async fn query_tasks(&self, sql: String) -> Result<Vec<Task>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map([], task_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await?
    }

    /// Persist an already-merged task row (see `TaskPatch::apply`).
    /// Returns false when the id no longer exists.
    pub async fn update_task(&self, task: Task) -> Result<bool> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "UPDATE tasks SET
                    name = ?2, api_endpoint = ?3, api_key = ?4, schedule_type = ?5,
                    interval_minutes = ?6, interval_seconds = ?7, fixed_time = ?8,
                    message_content = ?9, model = ?10, enabled = ?11, updated_at = ?12
                 WHERE id = ?1",
                rusqlite::params![
                    task.id,
                    task.name,
                    task.api_endpoint,
                    task.api_key,
                    task.schedule_type.as_str(),
                    task.interval_minutes,
                    task.interval_seconds,
                    task.fixed_time,
                    task.message_content,
                    task.model,
                    task.enabled as i64,
                    task.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(count > 0)
        })
        .await?
    }

    /// Delete a task; its execution logs go with it (cascade).
    pub async fn delete_task(&self, id: i64) -> Result<bool> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await?
    }

    // ─── Execution logs ───────────────────────────────────

    /// Insert one outcome record. Called only by the execution runner.
    pub async fn insert_log(&self, new: NewExecutionLog) -> Result<ExecutionLog> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO execution_logs
                    (task_id, executed_at, status, response_summary, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    new.task_id,
                    new.executed_at.to_rfc3339(),
                    new.status.as_str(),
                    new.response_summary,
                    new.error_message,
                ],
            )?;
            Ok(ExecutionLog {
                id: conn.last_insert_rowid(),
                task_id: new.task_id,
                executed_at: new.executed_at,
                status: new.status,
                response_summary: new.response_summary,
                error_message: new.error_message,
            })
        })
        .await?
    }

    /// List a task's outcome records, newest first.
    pub async fn list_logs(&self, task_id: i64, limit: u32) -> Result<Vec<ExecutionLog>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, task_id, executed_at, status, response_summary, error_message
                 FROM execution_logs
                 WHERE task_id = ?1
                 ORDER BY executed_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let logs = stmt
                .query_map(rusqlite::params![task_id, limit], log_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(logs)
        })
        .await?
    }

    /// Count a task's outcome records (used by tests and the gateway).
    pub async fn count_logs(&self, task_id: i64) -> Result<i64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.query_row(
                "SELECT COUNT(*) FROM execution_logs WHERE task_id = ?1",
                rusqlite::params![task_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await?
    }
}

const TASK_COLUMNS: &str = "id, name, api_endpoint, api_key, schedule_type, interval_minutes, \
     interval_seconds, fixed_time, message_content, model, enabled, created_at, updated_at";

fn task_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<Task, rusqlite::Error> {
    let schedule_type: String = row.get(4)?;
    let schedule_type: ScheduleType = schedule_type.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        api_endpoint: row.get(2)?,
        api_key: row.get(3)?,
        schedule_type,
        interval_minutes: row.get(5)?,
        interval_seconds: row.get(6)?,
        fixed_time: row.get(7)?,
        message_content: row.get(8)?,
        model: row.get(9)?,
        enabled: row.get::<_, i64>(10)? != 0,
        created_at: parse_timestamp(row, 11)?,
        updated_at: parse_timestamp(row, 12)?,
    })
}

fn log_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<ExecutionLog, rusqlite::Error> {
    let status: String = row.get(3)?;
    let status: ExecutionStatus = status.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(ExecutionLog {
        id: row.get(0)?,
        task_id: row.get(1)?,
        executed_at: parse_timestamp(row, 2)?,
        status,
        response_summary: row.get(4)?,
        error_message: row.get(5)?,
    })
}

fn parse_timestamp(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: chrono::ParseError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
