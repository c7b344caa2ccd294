//! The engine as the host sees it: cache, connectivity, tasks and sync wired together.

use async_trait::async_trait;
use chrono::Duration;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheStore, SetOptions, SqliteStorage, StorageError, StorageInfo, StoreOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::remote::{HttpRemote, RemoteDataSource};
use crate::sync::{EntityKind, Record, SyncCoordinator, SyncOutcome, SyncSettings, SyncState};
use crate::tasks::{
  SyncTag, SyncTask, TaskDispatcher, TaskError, TaskHandler, TaskHost, TaskRegistry,
};

/// How long a delivered booking confirmation stays readable offline.
const BOOKING_CONFIRMATION_TTL_DAYS: i64 = 30;

/// Storage settings for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineSettings {
  pub namespace: String,
  pub quota_bytes: u64,
  pub sync: SyncSettings,
}

impl EngineSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      namespace: config.cache.namespace.clone(),
      quota_bytes: config.cache.quota_bytes,
      sync: SyncSettings {
        user_id: config.remote.user_id.clone(),
        remote_ttl: config.cache.remote_ttl(),
      },
    }
  }
}

pub struct OfflineEngine {
  cache: CacheStore,
  coordinator: Arc<SyncCoordinator>,
  registry: TaskRegistry,
  host: Arc<TaskHost>,
  monitor: Arc<ConnectivityMonitor>,
}

impl OfflineEngine {
  /// Open the engine against the configured database and remote.
  ///
  /// Starts offline; the host reports connectivity once it has probed.
  pub fn open(config: &Config) -> Result<Self> {
    let db = Database::open(config.cache.path.as_deref())?;
    let remote = Arc::new(HttpRemote::new(&config.remote)?);

    let engine = Self::assemble(
      db,
      remote.clone(),
      remote,
      EngineSettings::from_config(config),
      Arc::new(SystemClock),
    );

    let purged = engine.cache.purge_expired()?;
    if purged > 0 {
      info!(purged, "purged expired cache entries");
    }
    Ok(engine)
  }

  pub fn assemble(
    db: Database,
    remote: Arc<dyn RemoteDataSource>,
    dispatcher: Arc<dyn TaskDispatcher>,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let backend = SqliteStorage::new(db.clone(), &settings.namespace, settings.quota_bytes);
    let cache = CacheStore::new(Arc::new(backend), clock.clone());
    let monitor = Arc::new(ConnectivityMonitor::new(false));

    let coordinator = Arc::new(SyncCoordinator::new(
      cache.clone(),
      remote,
      monitor.clone(),
      clock.clone(),
      settings.sync,
    ));

    let registry = TaskRegistry::new(db, clock);
    let handler = Arc::new(EngineTaskHandler {
      cache: cache.clone(),
      coordinator: coordinator.clone(),
      dispatcher,
    });
    let host = Arc::new(TaskHost::new(registry.clone(), handler, monitor.clone()));

    Self {
      cache,
      coordinator,
      registry,
      host,
      monitor,
    }
  }

  /// Read-only snapshot of the sync state.
  pub fn sync_status(&self) -> SyncState {
    self.coordinator.status()
  }

  /// Manual sync trigger. No-op while offline.
  pub async fn sync_data(&self) -> SyncOutcome {
    self.coordinator.sync_data().await
  }

  pub fn store_offline<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    options: SetOptions,
  ) -> Result<StoreOutcome, StorageError> {
    self.coordinator.store_offline(key, value, options)
  }

  pub fn get_offline<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
    self.coordinator.get_offline(key)
  }

  pub fn delete_offline(&self, key: &str) -> Result<(), StorageError> {
    self.cache.delete(key)
  }

  /// Register a deferred operation. Never touches the network.
  pub fn schedule_sync(&self, tag: SyncTag, payload: serde_json::Value) -> Result<i64, TaskError> {
    self.registry.schedule(tag, payload)
  }

  pub fn create_offline(
    &self,
    kind: EntityKind,
    data: serde_json::Value,
  ) -> Result<Record, StorageError> {
    self.coordinator.create_offline(kind, data)
  }

  pub fn cached_records(&self, kind: EntityKind) -> Result<Vec<Record>, StorageError> {
    self.coordinator.cached_records(kind)
  }

  pub fn storage_info(&self) -> Result<StorageInfo, StorageError> {
    self.cache.storage_info()
  }

  /// User-initiated "clear offline data".
  pub fn clear(&self) -> Result<(), StorageError> {
    self.cache.clear()
  }

  pub fn purge_expired(&self) -> Result<usize, StorageError> {
    self.cache.purge_expired()
  }

  pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
    &self.coordinator
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn registry(&self) -> &TaskRegistry {
    &self.registry
  }

  pub fn task_host(&self) -> &Arc<TaskHost> {
    &self.host
  }
}

/// Handler for every tag the engine schedules.
///
/// `booking-sync` keeps the confirmation readable offline and asks for a sync
/// pass; everything else is forwarded to the remote, keyed for idempotency.
struct EngineTaskHandler {
  cache: CacheStore,
  coordinator: Arc<SyncCoordinator>,
  dispatcher: Arc<dyn TaskDispatcher>,
}

impl EngineTaskHandler {
  fn booking_id(task: &SyncTask) -> Result<String, TaskError> {
    let id = task
      .payload
      .get("booking_id")
      .or_else(|| task.payload.get("id"));

    match id {
      Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
      Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
      _ => Err(TaskError::Handler(
        "booking-sync payload has no booking_id".to_string(),
      )),
    }
  }
}

#[async_trait]
impl TaskHandler for EngineTaskHandler {
  async fn handle(&self, task: &SyncTask) -> Result<(), TaskError> {
    if task.tag != SyncTag::BookingSync {
      self.dispatcher.dispatch(task).await?;
      return Ok(());
    }

    let key = format!("booking_confirmation:{}", Self::booking_id(task)?);
    let options = SetOptions::default().with_ttl(Duration::days(BOOKING_CONFIRMATION_TTL_DAYS));
    if let StoreOutcome::Dropped { reason } = self.cache.set(&key, &task.payload, options)? {
      return Err(StorageError::Dropped(reason).into());
    }

    let outcome = self.coordinator.sync_data().await;
    debug!(%key, ?outcome, "cached booking confirmation");
    Ok(())
  }
}
