//! Domain records tracked by reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::EntryType;

/// Category of record reconciled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Trip,
  Booking,
  EmergencyContacts,
}

impl EntityKind {
  /// Reconciliation order: trips, then bookings, then emergency contacts.
  pub const ALL: [EntityKind; 3] = [Self::Trip, Self::Booking, Self::EmergencyContacts];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Trip => "trip",
      Self::Booking => "booking",
      Self::EmergencyContacts => "contacts",
    }
  }

  pub fn entry_type(&self) -> EntryType {
    match self {
      Self::Trip => EntryType::Trip,
      Self::Booking => EntryType::Booking,
      Self::EmergencyContacts => EntryType::ContactSet,
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "trip" | "trips" => Ok(Self::Trip),
      "booking" | "bookings" => Ok(Self::Booking),
      "contacts" | "emergency-contacts" => Ok(Self::EmergencyContacts),
      other => Err(format!(
        "unknown record kind '{}' (expected trip, booking or contacts)",
        other
      )),
    }
  }
}

/// Identity of a record: created offline and unknown to the remote, or
/// assigned by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "origin", content = "value", rename_all = "snake_case")]
pub enum RecordId {
  Local(String),
  Remote(String),
}

impl RecordId {
  pub fn new_local() -> Self {
    Self::Local(uuid::Uuid::new_v4().to_string())
  }

  pub fn is_local(&self) -> bool {
    matches!(self, Self::Local(_))
  }

  pub fn value(&self) -> &str {
    match self {
      Self::Local(id) | Self::Remote(id) => id,
    }
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Local(id) => write!(f, "local:{}", id),
      Self::Remote(id) => write!(f, "remote:{}", id),
    }
  }
}

/// A trip, booking or emergency-contact set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: RecordId,
  pub kind: EntityKind,
  pub user_id: String,
  /// Local id this record was pushed from, echoed back by the remote
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client_ref: Option<String>,
  pub data: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Record {
  /// A new record created while offline.
  pub fn new_local(
    kind: EntityKind,
    user_id: impl Into<String>,
    data: serde_json::Value,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: RecordId::new_local(),
      kind,
      user_id: user_id.into(),
      client_ref: None,
      data,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn cache_key(&self) -> String {
    cache_key(self.kind, &self.id)
  }
}

/// Cache key of a record, e.g. `trip:local:<uuid>` or `trip:remote:R7`.
pub fn cache_key(kind: EntityKind, id: &RecordId) -> String {
  format!("{}:{}", kind.as_str(), id)
}
