//! Remote source of truth for trips, bookings and emergency contacts.

mod api_types;
mod client;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use thiserror::Error;

use crate::sync::{EntityKind, Record};

pub use client::HttpRemote;

/// Structured failure of a remote call. Never a panic, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// Network unreachable or timed out
  #[error("remote unreachable: {0}")]
  Connectivity(String),

  /// Validation or authorization failure
  #[error("remote rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },

  #[error("unexpected remote response: {0}")]
  Decode(String),
}

impl RemoteError {
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Connectivity(_))
  }
}

/// Per-entity-type access to the remote data service.
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
  /// Every record of `kind` owned by `user_id`.
  async fn list_by_user(&self, kind: EntityKind, user_id: &str)
    -> Result<Vec<Record>, RemoteError>;

  /// Create `record` remotely. Returns the stored copy with its remote id.
  async fn create(&self, record: &Record) -> Result<Record, RemoteError>;
}
