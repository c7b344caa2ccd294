//! Deferred network work that waits for connectivity.
//!
//! Tasks are recorded durably by [`TaskRegistry`] and handed back to a
//! [`TaskHandler`] by [`TaskHost`] once the device is online. Delivery is
//! at-least-once, so handlers must tolerate seeing the same task twice.

mod host;
mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::cache::StorageError;
use crate::remote::RemoteError;

pub use host::{TaskHandler, TaskHost};
pub use registry::TaskRegistry;

/// Kind of deferred operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTag {
  EmergencySync,
  LocationSync,
  BookingSync,
  /// Delivered on the host's recurring schedule rather than on demand
  LocationUpdate,
}

impl SyncTag {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::EmergencySync => "emergency-sync",
      Self::LocationSync => "location-sync",
      Self::BookingSync => "booking-sync",
      Self::LocationUpdate => "location-update",
    }
  }
}

impl fmt::Display for SyncTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncTag {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "emergency-sync" => Ok(Self::EmergencySync),
      "location-sync" => Ok(Self::LocationSync),
      "booking-sync" => Ok(Self::BookingSync),
      "location-update" => Ok(Self::LocationUpdate),
      other => Err(format!("unknown task tag '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  /// Handler failed; kept for inspection until rescheduled
  Failed,
}

/// A deferred operation and the data needed to complete it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncTask {
  /// Registry id. `None` for periodic deliveries, which are never stored.
  pub id: Option<i64>,
  pub tag: SyncTag,
  pub payload: serde_json::Value,
  pub content_key: String,
  pub status: TaskStatus,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub scheduled_at: DateTime<Utc>,
}

impl SyncTask {
  /// An unstored task for one periodic delivery.
  pub fn periodic(tag: SyncTag, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
    Self {
      id: None,
      tag,
      content_key: content_key(tag, &payload),
      payload,
      status: TaskStatus::Pending,
      attempts: 0,
      last_error: None,
      scheduled_at: now,
    }
  }
}

/// Hash of tag and payload, used to collapse duplicate pending tasks.
pub fn content_key(tag: SyncTag, payload: &serde_json::Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(tag.as_str().as_bytes());
  hasher.update(b":");
  // serde_json maps are sorted, so equal payloads hash equally
  hasher.update(payload.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

impl SyncTask {
  /// Key sent with the dispatched side effect.
  ///
  /// Derived from the task's identity, not its content: redeliveries of one
  /// task share it, while a later scheduling of the same payload gets a new one.
  pub fn dispatch_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.tag.as_str().as_bytes());
    hasher.update(b":");
    match self.id {
      Some(id) => hasher.update(id.to_string().as_bytes()),
      None => hasher.update(b"periodic"),
    }
    hasher.update(b":");
    hasher.update(self.scheduled_at.timestamp_millis().to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

#[derive(Debug, Error)]
pub enum TaskError {
  #[error("task handler failed: {0}")]
  Handler(String),

  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error("task store error: {0}")]
  Store(String),

  #[error("task store error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("invalid task payload: {0}")]
  Payload(#[from] serde_json::Error),

  #[error("no failed task with id {0}")]
  NotFound(i64),
}

impl TaskError {
  /// Failures worth another attempt once connectivity is back.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Remote(e) if e.is_connectivity())
  }
}

/// Sends a deferred task's side effect to the remote.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
  async fn dispatch(&self, task: &SyncTask) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_content_key_ignores_field_order() {
    let a = json!({"lat": 1.0, "lng": 2.0});
    let b: serde_json::Value = serde_json::from_str(r#"{"lng": 2.0, "lat": 1.0}"#).unwrap();
    assert_eq!(
      content_key(SyncTag::LocationSync, &a),
      content_key(SyncTag::LocationSync, &b)
    );
  }

  #[test]
  fn test_content_key_depends_on_tag() {
    let payload = json!({"message": "help"});
    assert_ne!(
      content_key(SyncTag::EmergencySync, &payload),
      content_key(SyncTag::LocationSync, &payload)
    );
  }

  #[test]
  fn test_dispatch_key_follows_task_identity() {
    let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
    let payload = json!({"message": "help"});
    let mut first = SyncTask::periodic(SyncTag::EmergencySync, payload.clone(), at);
    first.id = Some(1);
    let mut second = first.clone();
    second.id = Some(2);

    assert_eq!(first.content_key, second.content_key);
    assert_eq!(first.dispatch_key(), first.clone().dispatch_key());
    assert_ne!(first.dispatch_key(), second.dispatch_key());

    let earlier = SyncTask::periodic(SyncTag::LocationUpdate, payload.clone(), at);
    let later = SyncTask::periodic(
      SyncTag::LocationUpdate,
      payload,
      at + chrono::Duration::minutes(15),
    );
    assert_ne!(earlier.dispatch_key(), later.dispatch_key());
  }

  #[test]
  fn test_tag_parsing() {
    for tag in [
      SyncTag::EmergencySync,
      SyncTag::LocationSync,
      SyncTag::BookingSync,
      SyncTag::LocationUpdate,
    ] {
      assert_eq!(tag.as_str().parse::<SyncTag>().unwrap(), tag);
    }
    assert!("flight-sync".parse::<SyncTag>().is_err());
  }

  #[test]
  fn test_connectivity_errors_are_retryable() {
    let err = TaskError::Remote(RemoteError::Connectivity("timeout".into()));
    assert!(err.is_connectivity());
    assert!(!TaskError::Handler("bad payload".into()).is_connectivity());
  }
}
