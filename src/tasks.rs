//! Task persistence: one row per generation in flight,
//! tracked from submission through terminal state, and the cancellation flag
//! the poll loop checks on each tick.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub token_id: i64,
    pub model: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub progress: i64,
    pub result_urls: Vec<String>,
    pub error_message: Option<String>,
    pub cancelled: bool,
}

pub struct TaskStore {
    pool: Pool,
}

impl TaskStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn create(&self, task_id: &str, token_id: i64, model: &str, prompt: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO tasks (task_id, token_id, model, prompt, status, progress, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)",
            params![task_id, token_id, model, prompt, Utc::now().to_rfc3339()],
        )
        .context("inserting task row")?;
        Ok(())
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
            params![status.as_str(), task_id],
        )?;
        Ok(())
    }

    pub fn set_progress(&self, task_id: &str, progress: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tasks SET progress = ?1 WHERE task_id = ?2",
            params![progress, task_id],
        )?;
        Ok(())
    }

    pub fn set_result(&self, task_id: &str, urls: &[String]) -> Result<()> {
        let conn = self.pool.get()?;
        let joined = serde_json::to_string(urls)?;
        conn.execute(
            "UPDATE tasks SET status = 'succeeded', result_urls = ?1 WHERE task_id = ?2",
            params![joined, task_id],
        )?;
        Ok(())
    }

    pub fn set_error(&self, task_id: &str, message: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tasks SET status = 'failed', error_message = ?1 WHERE task_id = ?2",
            params![message, task_id],
        )?;
        Ok(())
    }

    /// Operator-initiated cancellation: sets the flag the poll loop observes
    /// on its next tick, and marks the task cancelled.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE tasks SET cancelled = 1, status = 'cancelled' WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(updated > 0)
    }

    pub fn is_cancelled(&self, task_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancelled FROM tasks WHERE task_id = ?1",
                params![task_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT task_id, token_id, model, prompt, status, progress, result_urls, error_message, cancelled
             FROM tasks WHERE task_id = ?1",
            params![task_id],
            |row| {
                let result_urls: Option<String> = row.get(6)?;
                Ok(TaskRecord {
                    task_id: row.get(0)?,
                    token_id: row.get(1)?,
                    model: row.get(2)?,
                    prompt: row.get(3)?,
                    status: TaskStatus::from_str(&row.get::<_, String>(4)?),
                    progress: row.get(5)?,
                    result_urls: result_urls
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_default(),
                    error_message: row.get(7)?,
                    cancelled: row.get::<_, i64>(8)? != 0,
                })
            },
        )
        .optional()
        .context("loading task")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        let path = std::env::temp_dir().join(format!("sora-broker-test-{}.sqlite3", uuid::Uuid::new_v4()));
        TaskStore::new(crate::db::open(&path).unwrap())
    }

    #[test]
    fn lifecycle_from_pending_to_succeeded() {
        let store = store();
        store.create("task-1", 1, "sora-image", "a cat").unwrap();
        let record = store.get("task-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);

        store.set_status("task-1", TaskStatus::Running).unwrap();
        store.set_progress("task-1", 42).unwrap();
        store
            .set_result("task-1", &["https://cdn.example/a.png".to_string()])
            .unwrap();

        let record = store.get("task-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.progress, 42);
        assert_eq!(record.result_urls, vec!["https://cdn.example/a.png".to_string()]);
    }

    #[test]
    fn cancellation_flag_is_observable() {
        let store = store();
        store.create("task-2", 1, "sora-video", "a dog").unwrap();
        assert!(!store.is_cancelled("task-2").unwrap());
        assert!(store.cancel("task-2").unwrap());
        assert!(store.is_cancelled("task-2").unwrap());

        let record = store.get("task-2").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
    }

    #[test]
    fn cancel_of_unknown_task_reports_false() {
        let store = store();
        assert!(!store.cancel("nonexistent").unwrap());
    }
}
