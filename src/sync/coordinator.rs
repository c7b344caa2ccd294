//! Reconciliation of locally-created records with the remote source of truth.

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::record::{EntityKind, Record};
use super::state::{SyncOutcome, SyncReport, SyncState};
use crate::cache::{CacheStore, SetOptions, StorageError, StoreOutcome};
use crate::clock::Clock;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::remote::RemoteDataSource;

/// Per-user settings for reconciliation.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub user_id: String,
  /// TTL for read-through copies of remote records. `None` keeps them forever.
  pub remote_ttl: Option<Duration>,
}

/// Owns the sync state machine: `Idle -> Syncing -> Idle`.
///
/// At most one pass runs at a time. Triggers that arrive while a pass is
/// running are dropped, not queued. A pass always runs to completion and
/// always returns to idle, whatever failed along the way.
pub struct SyncCoordinator {
  cache: CacheStore,
  remote: Arc<dyn RemoteDataSource>,
  monitor: Arc<ConnectivityMonitor>,
  clock: Arc<dyn Clock>,
  settings: SyncSettings,
  syncing: AtomicBool,
  state: watch::Sender<SyncState>,
}

/// Clears the in-flight flag when a pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl SyncCoordinator {
  pub fn new(
    cache: CacheStore,
    remote: Arc<dyn RemoteDataSource>,
    monitor: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
  ) -> Self {
    let (state, _) = watch::channel(SyncState {
      is_online: monitor.is_online(),
      ..SyncState::default()
    });

    let coordinator = Self {
      cache,
      remote,
      monitor,
      clock,
      settings,
      syncing: AtomicBool::new(false),
      state,
    };

    // Offline records left by an earlier run are still pending
    match coordinator.count_pending() {
      Ok(pending) => coordinator.state.send_modify(|s| s.pending_items = pending),
      Err(e) => warn!("counting pending records at startup: {}", e),
    }
    coordinator
  }

  /// Read-only snapshot of the current state.
  pub fn status(&self) -> SyncState {
    let mut state = self.state.borrow().clone();
    state.is_online = self.monitor.is_online();
    state
  }

  /// Stream of state changes.
  pub fn subscribe_status(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  /// React to a connectivity transition. Going online starts a pass.
  pub async fn on_connectivity(&self, event: ConnectivityEvent) -> Option<SyncOutcome> {
    let online = event == ConnectivityEvent::WentOnline;
    self.state.send_modify(|s| s.is_online = online);

    if online {
      Some(self.run_pass().await)
    } else {
      None
    }
  }

  /// Manual trigger. Does nothing while offline.
  pub async fn sync_data(&self) -> SyncOutcome {
    if !self.monitor.is_online() {
      debug!("offline, ignoring manual sync");
      return SyncOutcome::Offline;
    }
    self.run_pass().await
  }

  /// Create a record while offline. It is pushed by the next pass.
  pub fn create_offline(
    &self,
    kind: EntityKind,
    data: serde_json::Value,
  ) -> Result<Record, StorageError> {
    let record = Record::new_local(kind, &self.settings.user_id, data, self.clock.now());
    let outcome = self
      .cache
      .set(&record.cache_key(), &record, SetOptions::typed(kind.entry_type()))?;
    if let StoreOutcome::Dropped { reason } = outcome {
      return Err(StorageError::Dropped(reason));
    }

    self.state.send_modify(|s| s.pending_items += 1);
    info!(%kind, id = %record.id, "created offline record");
    Ok(record)
  }

  /// Every cached record of `kind`, local and remote.
  pub fn cached_records(&self, kind: EntityKind) -> Result<Vec<Record>, StorageError> {
    Ok(
      self
        .cache
        .entries_of_type::<Record>(kind.entry_type())?
        .into_iter()
        .map(|(_, record)| record)
        .filter(|record| record.kind == kind)
        .collect(),
    )
  }

  /// Cache an arbitrary payload outside of reconciliation.
  pub fn store_offline<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    options: SetOptions,
  ) -> Result<StoreOutcome, StorageError> {
    self.cache.set(key, value, options)
  }

  pub fn get_offline<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
    self.cache.get(key)
  }

  async fn run_pass(&self) -> SyncOutcome {
    // Claimed before the first await so near-simultaneous triggers cannot both enter
    if self
      .syncing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("sync pass already running, coalescing trigger");
      return SyncOutcome::Coalesced;
    }
    let _guard = PassGuard(&self.syncing);

    self.state.send_modify(|s| {
      s.is_syncing = true;
      s.pending_items = 0;
      s.sync_errors.clear();
    });
    info!(user = %self.settings.user_id, "sync pass started");

    let mut report = SyncReport::default();
    for kind in EntityKind::ALL {
      self.reconcile(kind, &mut report).await;
    }

    let pending = match self.count_pending() {
      Ok(count) => Some(count),
      Err(e) => {
        self.record_error(format!("counting pending records: {}", e));
        None
      }
    };
    let now = self.clock.now();
    self.state.send_modify(|s| {
      s.is_syncing = false;
      s.last_sync = Some(now);
      if let Some(pending) = pending {
        s.pending_items = pending;
      }
    });

    let state = self.state.borrow().clone();
    info!(
      pushed = report.pushed,
      failed = report.failed,
      cached = report.cached,
      pending = state.pending_items,
      errors = state.sync_errors.len(),
      "sync pass finished"
    );
    SyncOutcome::Completed(report)
  }

  /// Fetch, cache and push one entity type. Never aborts the pass.
  async fn reconcile(&self, kind: EntityKind, report: &mut SyncReport) {
    let remote = match self.remote.list_by_user(kind, &self.settings.user_id).await {
      Ok(records) => records,
      Err(e) => {
        self.record_error(format!("{}: fetch failed: {}", kind, e));
        return;
      }
    };
    debug!(%kind, count = remote.len(), "fetched remote records");

    let mut pushed_refs = HashSet::new();
    for record in &remote {
      if let Some(client_ref) = &record.client_ref {
        pushed_refs.insert(client_ref.clone());
      }
      self.cache_remote(record, report);
    }

    let locals = match self.local_records(kind) {
      Ok(locals) => locals,
      Err(e) => {
        self.record_error(format!("{}: reading local records: {}", kind, e));
        return;
      }
    };

    for local in locals {
      let key = local.cache_key();

      // Pushed by an earlier pass that stopped before discarding the local copy
      if pushed_refs.contains(local.id.value()) {
        match self.cache.delete(&key) {
          Ok(()) => report.already_synced += 1,
          Err(e) => self.record_error(format!("{} {}: {}", kind, local.id, e)),
        }
        continue;
      }

      match self.remote.create(&local).await {
        Ok(created) => {
          self.cache_remote(&created, report);
          if let Err(e) = self.cache.delete(&key) {
            self.record_error(format!("{} {}: discarding local copy: {}", kind, local.id, e));
          }
          report.pushed += 1;
          info!(%kind, local = %local.id, remote = %created.id, "pushed offline record");
        }
        Err(e) => {
          report.failed += 1;
          warn!(%kind, id = %local.id, "push failed: {}", e);
          let message = format!("{} {}: push failed: {}", kind, local.id, e);
          self.state.send_modify(|s| {
            s.pending_items += 1;
            s.sync_errors.push(message);
          });
        }
      }
    }
  }

  fn cache_remote(&self, record: &Record, report: &mut SyncReport) {
    let mut options = SetOptions::typed(record.kind.entry_type());
    if let Some(ttl) = self.settings.remote_ttl {
      options = options.with_ttl(ttl);
    }

    match self.cache.set(&record.cache_key(), record, options) {
      Ok(StoreOutcome::Dropped { reason }) => {
        self.record_error(format!("{} {}: not cached: {}", record.kind, record.id, reason))
      }
      Ok(_) => report.cached += 1,
      Err(e) => self.record_error(format!("{} {}: not cached: {}", record.kind, record.id, e)),
    }
  }

  fn local_records(&self, kind: EntityKind) -> Result<Vec<Record>, StorageError> {
    Ok(
      self
        .cached_records(kind)?
        .into_iter()
        .filter(|record| record.id.is_local())
        .collect(),
    )
  }

  fn count_pending(&self) -> Result<usize, StorageError> {
    let mut pending = 0;
    for kind in EntityKind::ALL {
      pending += self.local_records(kind)?.len();
    }
    Ok(pending)
  }

  fn record_error(&self, message: String) {
    warn!("{}", message);
    self.state.send_modify(|s| s.sync_errors.push(message));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::clock::ManualClock;
  use crate::db::Database;
  use crate::remote::fake::FakeRemote;
  use crate::sync::RecordId;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  struct Harness {
    coordinator: SyncCoordinator,
    remote: Arc<FakeRemote>,
    monitor: Arc<ConnectivityMonitor>,
    clock: Arc<ManualClock>,
  }

  fn harness(online: bool) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let backend = SqliteStorage::new(Database::open_in_memory().unwrap(), "test", 1 << 20);
    let cache = CacheStore::new(Arc::new(backend), clock.clone());
    let remote = Arc::new(FakeRemote::new());
    let monitor = Arc::new(ConnectivityMonitor::new(online));
    let coordinator = SyncCoordinator::new(
      cache,
      remote.clone(),
      monitor.clone(),
      clock.clone(),
      SyncSettings {
        user_id: "u1".into(),
        remote_ttl: Some(Duration::days(7)),
      },
    );
    Harness {
      coordinator,
      remote,
      monitor,
      clock,
    }
  }

  fn completed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
      SyncOutcome::Completed(report) => report,
      other => panic!("expected a completed pass, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_offline_trip_is_promoted_when_back_online() {
    let h = harness(false);
    let trip = h
      .coordinator
      .create_offline(EntityKind::Trip, json!({"name": "Lisbon"}))
      .unwrap();
    assert_eq!(h.coordinator.status().pending_items, 1);

    let mut events = h.monitor.subscribe();
    h.monitor.report(true);
    let event = events.recv().await.unwrap();
    let report = completed(h.coordinator.on_connectivity(event).await.unwrap());

    assert_eq!(report.pushed, 1);
    let status = h.coordinator.status();
    assert_eq!(status.pending_items, 0);
    assert!(status.last_sync.is_some());
    assert!(!status.is_syncing);

    assert_eq!(h.coordinator.get_offline::<Record>(&trip.cache_key()).unwrap(), None);
    let trips = h.coordinator.cached_records(EntityKind::Trip).unwrap();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].id, RecordId::Remote("R1".into()));
    assert_eq!(trips[0].client_ref.as_deref(), Some(trip.id.value()));
    assert_eq!(trips[0].data, json!({"name": "Lisbon"}));
  }

  #[tokio::test]
  async fn test_manual_sync_is_noop_offline() {
    let h = harness(false);
    h.coordinator
      .create_offline(EntityKind::Booking, json!({}))
      .unwrap();

    assert_eq!(h.coordinator.sync_data().await, SyncOutcome::Offline);
    assert_eq!(*h.remote.list_calls.lock().unwrap(), 0);
    assert_eq!(h.coordinator.status().last_sync, None);
  }

  #[tokio::test]
  async fn test_concurrent_triggers_run_one_pass() {
    let h = harness(true);
    h.coordinator
      .create_offline(EntityKind::Trip, json!({"name": "Oslo"}))
      .unwrap();

    let c = &h.coordinator;
    let (a, b) = tokio::join!(c.sync_data(), c.sync_data());

    let outcomes = [a, b];
    let completed = outcomes
      .iter()
      .filter(|o| matches!(o, SyncOutcome::Completed(_)))
      .count();
    let coalesced = outcomes
      .iter()
      .filter(|o| **o == SyncOutcome::Coalesced)
      .count();
    assert_eq!((completed, coalesced), (1, 1));
    assert_eq!(h.remote.push_count(), 1);
    assert_eq!(*h.remote.list_calls.lock().unwrap(), 3);
  }

  #[tokio::test]
  async fn test_second_pass_changes_nothing() {
    let h = harness(true);
    h.remote.insert(Record {
      id: RecordId::Remote("R100".into()),
      kind: EntityKind::Trip,
      user_id: "u1".into(),
      client_ref: None,
      data: json!({"name": "Rome"}),
      created_at: h.clock.now(),
      updated_at: h.clock.now(),
    });
    let rejected = h
      .coordinator
      .create_offline(EntityKind::Booking, json!({"hotel": "?"}))
      .unwrap();
    h.remote.reject_push_of(rejected.id.value());
    h.coordinator
      .create_offline(EntityKind::Trip, json!({"name": "Paris"}))
      .unwrap();

    completed(h.coordinator.sync_data().await);
    let pending = h.coordinator.status().pending_items;
    let snapshot: Vec<_> = EntityKind::ALL
      .iter()
      .map(|kind| h.coordinator.cached_records(*kind).unwrap())
      .collect();

    let report = completed(h.coordinator.sync_data().await);

    assert_eq!(report.pushed, 0);
    assert_eq!(h.coordinator.status().pending_items, pending);
    assert_eq!(pending, 1);
    let after: Vec<_> = EntityKind::ALL
      .iter()
      .map(|kind| h.coordinator.cached_records(*kind).unwrap())
      .collect();
    assert_eq!(after, snapshot);
  }

  #[tokio::test]
  async fn test_failed_booking_does_not_block_contacts() {
    let h = harness(true);
    let bad = h
      .coordinator
      .create_offline(EntityKind::Booking, json!({"ref": "bad"}))
      .unwrap();
    h.coordinator
      .create_offline(EntityKind::Booking, json!({"ref": "good"}))
      .unwrap();
    h.coordinator
      .create_offline(EntityKind::EmergencyContacts, json!({"contacts": ["Ana"]}))
      .unwrap();
    h.remote.reject_push_of(bad.id.value());

    let report = completed(h.coordinator.sync_data().await);

    assert_eq!(report.pushed, 2);
    assert_eq!(report.failed, 1);
    let status = h.coordinator.status();
    assert!(status.last_sync.is_some());
    assert_eq!(status.pending_items, 1);
    assert_eq!(status.sync_errors.len(), 1);
    assert!(status.sync_errors[0].starts_with("booking"));
    assert_eq!(h.remote.rows(EntityKind::EmergencyContacts).len(), 1);

    // The rejected record is untouched and still local
    let bookings = h.coordinator.cached_records(EntityKind::Booking).unwrap();
    assert!(bookings.iter().any(|r| r.id == bad.id));
  }

  #[tokio::test]
  async fn test_unreachable_type_is_skipped_and_reported() {
    let h = harness(true);
    h.coordinator
      .create_offline(EntityKind::Trip, json!({}))
      .unwrap();
    h.coordinator
      .create_offline(EntityKind::Booking, json!({}))
      .unwrap();
    h.remote.make_unreachable(EntityKind::Trip);

    let report = completed(h.coordinator.sync_data().await);

    assert_eq!(report.pushed, 1);
    let status = h.coordinator.status();
    assert_eq!(status.pending_items, 1);
    assert_eq!(status.sync_errors.len(), 1);
    assert!(status.sync_errors[0].contains("fetch failed"));
    assert!(h.remote.rows(EntityKind::Trip).is_empty());
  }

  #[tokio::test]
  async fn test_errors_are_cleared_by_next_pass() {
    let h = harness(true);
    let trip = h
      .coordinator
      .create_offline(EntityKind::Trip, json!({}))
      .unwrap();
    h.remote.reject_push_of(trip.id.value());

    completed(h.coordinator.sync_data().await);
    assert_eq!(h.coordinator.status().sync_errors.len(), 1);

    h.remote.allow_all_pushes();
    let report = completed(h.coordinator.sync_data().await);

    assert_eq!(report.pushed, 1);
    let status = h.coordinator.status();
    assert!(status.sync_errors.is_empty());
    assert_eq!(status.pending_items, 0);
  }

  #[tokio::test]
  async fn test_already_pushed_record_is_not_pushed_again() {
    let h = harness(true);
    let trip = h
      .coordinator
      .create_offline(EntityKind::Trip, json!({"name": "Kyoto"}))
      .unwrap();
    // The remote has it already, but the local copy was never discarded
    h.remote.insert(Record {
      id: RecordId::Remote("R9".into()),
      client_ref: Some(trip.id.value().to_string()),
      ..trip.clone()
    });

    let report = completed(h.coordinator.sync_data().await);

    assert_eq!(report.already_synced, 1);
    assert_eq!(h.remote.push_count(), 0);
    let trips = h.coordinator.cached_records(EntityKind::Trip).unwrap();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].id, RecordId::Remote("R9".into()));
  }

  #[tokio::test]
  async fn test_remote_records_are_cached_with_ttl() {
    let h = harness(true);
    h.remote.insert(Record {
      id: RecordId::Remote("R1".into()),
      kind: EntityKind::EmergencyContacts,
      user_id: "u1".into(),
      client_ref: None,
      data: json!({"contacts": []}),
      created_at: h.clock.now(),
      updated_at: h.clock.now(),
    });

    completed(h.coordinator.sync_data().await);
    assert_eq!(
      h.coordinator
        .cached_records(EntityKind::EmergencyContacts)
        .unwrap()
        .len(),
      1
    );

    h.clock.advance(Duration::days(7));
    assert!(h
      .coordinator
      .cached_records(EntityKind::EmergencyContacts)
      .unwrap()
      .is_empty());
  }

  #[test]
  fn test_pending_items_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let clock = Arc::new(ManualClock::new());
    let open = || {
      let backend = SqliteStorage::new(Database::open(Some(&path)).unwrap(), "test", 1 << 20);
      SyncCoordinator::new(
        CacheStore::new(Arc::new(backend), clock.clone()),
        Arc::new(FakeRemote::new()),
        Arc::new(ConnectivityMonitor::new(false)),
        clock.clone(),
        SyncSettings {
          user_id: "u1".into(),
          remote_ttl: None,
        },
      )
    };

    {
      let coordinator = open();
      assert_eq!(coordinator.status().pending_items, 0);
      coordinator.create_offline(EntityKind::Trip, json!({})).unwrap();
      coordinator.create_offline(EntityKind::Booking, json!({})).unwrap();
    }

    let coordinator = open();
    assert_eq!(coordinator.status().pending_items, 2);
  }

  #[tokio::test]
  async fn test_going_offline_updates_status_without_a_pass() {
    let h = harness(true);
    let mut status = h.coordinator.subscribe_status();

    h.monitor.report(false);
    let outcome = h
      .coordinator
      .on_connectivity(ConnectivityEvent::WentOffline)
      .await;

    assert_eq!(outcome, None);
    assert!(status.has_changed().unwrap());
    assert!(!status.borrow_and_update().is_online);
    assert_eq!(*h.remote.list_calls.lock().unwrap(), 0);
  }
}
