//! Cache entry types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tag used for storage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryType {
  Trip,
  Booking,
  ContactSet,
  Generic,
}

impl EntryType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Trip => "trip",
      Self::Booking => "booking",
      Self::ContactSet => "contact-set",
      Self::Generic => "generic",
    }
  }
}

impl fmt::Display for EntryType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntryType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "trip" => Ok(Self::Trip),
      "booking" => Ok(Self::Booking),
      "contact-set" => Ok(Self::ContactSet),
      "generic" => Ok(Self::Generic),
      other => Err(format!("unknown entry type '{}'", other)),
    }
  }
}

/// Options for a cache write.
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
  /// Time to live. `None` means the entry does not expire.
  pub ttl: Option<Duration>,
  pub entry_type: EntryType,
}

impl Default for SetOptions {
  fn default() -> Self {
    Self {
      ttl: None,
      entry_type: EntryType::Generic,
    }
  }
}

impl SetOptions {
  pub fn typed(entry_type: EntryType) -> Self {
    Self {
      entry_type,
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }
}

/// A serialized entry as held by a storage backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
  pub key: String,
  pub entry_type: EntryType,
  /// JSON-encoded payload
  pub value: Vec<u8>,
  pub created_at: DateTime<Utc>,
  /// `created_at + ttl`, recomputed on every write
  pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
  /// Estimated footprint used for quota accounting.
  pub fn size_bytes(&self) -> u64 {
    (self.key.len() + self.value.len()) as u64
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    is_expired(self.expires_at, now)
  }
}

/// Entry metadata without the payload, used for eviction and accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
  pub key: String,
  pub entry_type: EntryType,
  pub size_bytes: u64,
  pub created_at: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl EntryMeta {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    is_expired(self.expires_at, now)
  }
}

fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
  expires_at.is_some_and(|at| now >= at)
}
