//! Durable task records in SQLite.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{content_key, SyncTag, SyncTask, TaskError, TaskStatus};
use crate::clock::Clock;
use crate::db::Database;

/// Durable registry of deferred tasks.
///
/// Scheduling only touches local storage and wakes the delivery loop; it
/// never waits on the network.
#[derive(Clone)]
pub struct TaskRegistry {
  db: Database,
  clock: Arc<dyn Clock>,
  wakeup: Arc<Notify>,
}

impl TaskRegistry {
  pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
    Self {
      db,
      clock,
      wakeup: Arc::new(Notify::new()),
    }
  }

  /// Signalled whenever a task becomes pending.
  pub fn wakeup(&self) -> Arc<Notify> {
    Arc::clone(&self.wakeup)
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Record a task. A pending task with the same tag and payload is reused.
  pub fn schedule(&self, tag: SyncTag, payload: serde_json::Value) -> Result<i64, TaskError> {
    let key = content_key(tag, &payload);
    let conn = self.lock()?;

    let existing: Option<i64> = conn
      .query_row(
        "SELECT id FROM sync_tasks WHERE content_key = ? AND status = 'pending'",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    if let Some(id) = existing {
      debug!(id, %tag, "task already pending, not scheduling twice");
      return Ok(id);
    }

    conn.execute(
      "INSERT INTO sync_tasks (tag, payload, content_key, status, attempts, scheduled_at)
       VALUES (?, ?, ?, 'pending', 0, ?)",
      params![
        tag.as_str(),
        payload.to_string(),
        key,
        self.clock.now().timestamp_millis()
      ],
    )?;
    let id = conn.last_insert_rowid();
    drop(conn);

    info!(id, %tag, "scheduled background task");
    self.wakeup.notify_one();
    Ok(id)
  }

  /// Pending tasks in scheduling order.
  pub fn pending(&self) -> Result<Vec<SyncTask>, TaskError> {
    self.by_status(TaskStatus::Pending)
  }

  /// Tasks whose last delivery failed.
  pub fn failed(&self) -> Result<Vec<SyncTask>, TaskError> {
    self.by_status(TaskStatus::Failed)
  }

  /// Note that delivery of `id` is starting.
  pub fn record_attempt(&self, id: i64) -> Result<(), TaskError> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE sync_tasks SET attempts = attempts + 1 WHERE id = ?",
      params![id],
    )?;
    Ok(())
  }

  /// Drop a delivered task. Completing an unknown id is a no-op.
  pub fn complete(&self, id: i64) -> Result<(), TaskError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM sync_tasks WHERE id = ?", params![id])?;
    Ok(())
  }

  /// Mark a task failed. It will not be delivered again unless rescheduled.
  pub fn fail(&self, id: i64, error: &str) -> Result<(), TaskError> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE sync_tasks SET status = 'failed', last_error = ? WHERE id = ?",
      params![error, id],
    )?;
    warn!(id, error, "background task failed");
    Ok(())
  }

  /// Put a failed task back in the queue.
  pub fn reschedule(&self, id: i64) -> Result<(), TaskError> {
    let conn = self.lock()?;
    let updated = conn.execute(
      "UPDATE sync_tasks SET status = 'pending' WHERE id = ? AND status = 'failed'",
      params![id],
    )?;
    drop(conn);

    if updated == 0 {
      return Err(TaskError::NotFound(id));
    }
    info!(id, "rescheduled background task");
    self.wakeup.notify_one();
    Ok(())
  }

  fn by_status(&self, status: TaskStatus) -> Result<Vec<SyncTask>, TaskError> {
    let status = match status {
      TaskStatus::Pending => "pending",
      TaskStatus::Failed => "failed",
    };
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, tag, payload, content_key, status, attempts, last_error, scheduled_at
       FROM sync_tasks WHERE status = ? ORDER BY id",
    )?;

    let tasks = stmt
      .query_map(params![status], row_to_task)?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, TaskError> {
    self
      .db
      .conn()
      .lock()
      .map_err(|e| TaskError::Store(format!("lock poisoned: {}", e)))
  }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<SyncTask> {
  let tag: String = row.get(1)?;
  let payload: String = row.get(2)?;
  let status: String = row.get(4)?;
  let scheduled_at: i64 = row.get(7)?;

  Ok(SyncTask {
    id: Some(row.get(0)?),
    tag: tag
      .parse()
      .map_err(|e: String| conversion_error(1, e.into()))?,
    payload: serde_json::from_str(&payload).map_err(|e| conversion_error(2, e.into()))?,
    content_key: row.get(3)?,
    status: if status == "failed" {
      TaskStatus::Failed
    } else {
      TaskStatus::Pending
    },
    attempts: row.get::<_, i64>(5)?.max(0) as u32,
    last_error: row.get(6)?,
    scheduled_at: DateTime::from_timestamp_millis(scheduled_at).unwrap_or_default(),
  })
}

fn conversion_error(
  idx: usize,
  err: Box<dyn std::error::Error + Send + Sync>,
) -> rusqlite::Error {
  rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err)
}
