//! Serde types matching the data service's JSON.
//!
//! Kept apart from the domain types so the wire shape can change without
//! touching reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::{EntityKind, Record, RecordId};

/// A row as returned by the data service.
#[derive(Debug, Deserialize)]
pub struct ApiRecord {
  pub id: String,
  pub user_id: String,
  #[serde(default)]
  pub client_ref: Option<String>,
  #[serde(default)]
  pub data: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl ApiRecord {
  pub fn into_record(self, kind: EntityKind) -> Record {
    Record {
      id: RecordId::Remote(self.id),
      kind,
      user_id: self.user_id,
      client_ref: self.client_ref,
      data: self.data,
      created_at: self.created_at,
      updated_at: self.updated_at,
    }
  }
}

/// Body of a create request for a locally-originated record.
#[derive(Debug, Serialize)]
pub struct ApiNewRecord<'a> {
  pub user_id: &'a str,
  pub client_ref: &'a str,
  pub data: &'a serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl<'a> ApiNewRecord<'a> {
  pub fn from_record(record: &'a Record) -> Self {
    Self {
      user_id: &record.user_id,
      client_ref: record.id.value(),
      data: &record.data,
      created_at: record.created_at,
      updated_at: record.updated_at,
    }
  }
}

/// Create endpoints answer with either the row or a one-element array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiCreateResponse {
  One(ApiRecord),
  Many(Vec<ApiRecord>),
}

impl ApiCreateResponse {
  pub fn into_single(self) -> Option<ApiRecord> {
    match self {
      Self::One(record) => Some(record),
      Self::Many(records) => records.into_iter().next(),
    }
  }
}

/// Body of a deferred task dispatch.
#[derive(Debug, Serialize)]
pub struct ApiTaskDispatch<'a> {
  pub tag: &'a str,
  pub payload: &'a serde_json::Value,
  pub scheduled_at: DateTime<Utc>,
}

/// Path segment of the collection holding `kind`.
pub fn collection(kind: EntityKind) -> &'static str {
  match kind {
    EntityKind::Trip => "trips",
    EntityKind::Booking => "bookings",
    EntityKind::EmergencyContacts => "emergency_contacts",
  }
}
