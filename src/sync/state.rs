use chrono::{DateTime, Utc};
use serde::Serialize;

/// In-memory snapshot of the engine's sync status. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
  pub is_online: bool,
  /// True only while a reconciliation pass is running
  pub is_syncing: bool,
  /// End of the last completed pass
  pub last_sync: Option<DateTime<Utc>>,
  /// Locally-created records the remote has not confirmed yet
  pub pending_items: usize,
  /// Errors from the most recent pass, in order
  pub sync_errors: Vec<String>,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Remote records written to the cache
  pub cached: usize,
  /// Local records created remotely during this pass
  pub pushed: usize,
  /// Local records already present remotely, discarded without a push
  pub already_synced: usize,
  /// Local records whose push failed
  pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  Completed(SyncReport),
  /// Another pass was already running; this trigger was folded into it
  Coalesced,
  /// Manual trigger while offline; nothing ran
  Offline,
}
