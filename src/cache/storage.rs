//! Storage backend trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use thiserror::Error;

use super::entry::{EntryMeta, EntryType, StoredEntry};
use crate::db::Database;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage quota exceeded: need {needed} bytes, {available} available")]
  QuotaExceeded { needed: u64, available: u64 },

  #[error("storage backend error: {0}")]
  Backend(String),

  #[error("cache write dropped: {0}")]
  Dropped(String),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Quota and current usage of a backend, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
  pub quota: u64,
  pub usage: u64,
}

/// Percent of the quota above which writes trigger eviction.
const HIGH_WATER_PERCENT: u64 = 90;
/// Percent of the quota eviction brings usage back down to.
const LOW_WATER_PERCENT: u64 = 80;

impl StorageEstimate {
  /// Whether writing `incoming` more bytes would cross the high-water mark.
  pub fn is_approaching(&self, incoming: u64) -> bool {
    self.usage + incoming > self.quota * HIGH_WATER_PERCENT / 100
  }

  /// Bytes to free so that usage plus `incoming` sits at the low-water mark.
  pub fn excess_over_low_water(&self, incoming: u64) -> u64 {
    (self.usage + incoming).saturating_sub(self.quota * LOW_WATER_PERCENT / 100)
  }
}

/// A namespaced, quota-bounded key/value medium.
pub trait StorageBackend: Send + Sync {
  /// Fetch an entry, expired or not.
  fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError>;

  /// Insert or replace an entry. Fails with `QuotaExceeded` if it does not fit.
  fn put(&self, entry: &StoredEntry) -> Result<(), StorageError>;

  /// Remove an entry. Returns whether it existed.
  fn delete(&self, key: &str) -> Result<bool, StorageError>;

  /// Remove every entry in the namespace.
  fn clear(&self) -> Result<(), StorageError>;

  /// Metadata for every entry in the namespace.
  fn entries(&self) -> Result<Vec<EntryMeta>, StorageError>;

  /// Every entry of one type, ordered by key.
  fn entries_of_type(&self, entry_type: EntryType) -> Result<Vec<StoredEntry>, StorageError>;

  /// Remove every entry that expired at or before `now`.
  fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;

  fn estimate(&self) -> Result<StorageEstimate, StorageError>;
}

/// SQLite-based storage backend. Entries live in `cache_entries`, scoped to a namespace.
pub struct SqliteStorage {
  db: Database,
  namespace: String,
  quota: u64,
}

impl SqliteStorage {
  pub fn new(db: Database, namespace: impl Into<String>, quota: u64) -> Self {
    Self {
      db,
      namespace: namespace.into(),
      quota,
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, StorageError> {
    self
      .db
      .conn()
      .lock()
      .map_err(|e| StorageError::Backend(format!("lock poisoned: {}", e)))
  }
}

impl StorageBackend for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
    let conn = self.lock()?;
    let entry = conn
      .query_row(
        "SELECT key, entry_type, value, created_at, expires_at FROM cache_entries
         WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
        row_to_entry,
      )
      .optional()?;
    Ok(entry)
  }

  fn put(&self, entry: &StoredEntry) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let usage: i64 = tx.query_row(
      "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries WHERE namespace = ?",
      params![self.namespace],
      |row| row.get(0),
    )?;
    let replaced: i64 = tx
      .query_row(
        "SELECT size_bytes FROM cache_entries WHERE namespace = ? AND key = ?",
        params![self.namespace, entry.key],
        |row| row.get(0),
      )
      .optional()?
      .unwrap_or(0);

    let used_by_others = (usage - replaced).max(0) as u64;
    let needed = entry.size_bytes();
    if used_by_others + needed > self.quota {
      return Err(StorageError::QuotaExceeded {
        needed,
        available: self.quota.saturating_sub(used_by_others),
      });
    }

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (namespace, key, entry_type, value, size_bytes, created_at, expires_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        self.namespace,
        entry.key,
        entry.entry_type.as_str(),
        entry.value,
        needed as i64,
        entry.created_at.timestamp_millis(),
        entry.expires_at.map(|at| at.timestamp_millis()),
      ],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE namespace = ? AND key = ?",
      params![self.namespace, key],
    )?;
    Ok(removed > 0)
  }

  fn clear(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![self.namespace],
    )?;
    Ok(())
  }

  fn entries(&self) -> Result<Vec<EntryMeta>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT key, entry_type, size_bytes, created_at, expires_at FROM cache_entries
       WHERE namespace = ?",
    )?;

    let rows = stmt
      .query_map(params![self.namespace], |row| {
        Ok(EntryMeta {
          key: row.get(0)?,
          entry_type: entry_type_column(row, 1)?,
          size_bytes: row.get::<_, i64>(2)?.max(0) as u64,
          created_at: millis_to_datetime(row.get(3)?),
          expires_at: row.get::<_, Option<i64>>(4)?.map(millis_to_datetime),
        })
      })?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
  }

  fn entries_of_type(&self, entry_type: EntryType) -> Result<Vec<StoredEntry>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT key, entry_type, value, created_at, expires_at FROM cache_entries
       WHERE namespace = ? AND entry_type = ?
       ORDER BY key",
    )?;

    let rows = stmt
      .query_map(params![self.namespace, entry_type.as_str()], row_to_entry)?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
  }

  fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries
       WHERE namespace = ? AND expires_at IS NOT NULL AND expires_at <= ?",
      params![self.namespace, now.timestamp_millis()],
    )?;
    Ok(removed)
  }

  fn estimate(&self) -> Result<StorageEstimate, StorageError> {
    let conn = self.lock()?;
    let usage: i64 = conn.query_row(
      "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries WHERE namespace = ?",
      params![self.namespace],
      |row| row.get(0),
    )?;

    Ok(StorageEstimate {
      quota: self.quota,
      usage: usage.max(0) as u64,
    })
  }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<StoredEntry> {
  Ok(StoredEntry {
    key: row.get(0)?,
    entry_type: entry_type_column(row, 1)?,
    value: row.get(2)?,
    created_at: millis_to_datetime(row.get(3)?),
    expires_at: row.get::<_, Option<i64>>(4)?.map(millis_to_datetime),
  })
}

fn entry_type_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<EntryType> {
  let raw: String = row.get(idx)?;
  raw.parse().map_err(|e: String| {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
  })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
