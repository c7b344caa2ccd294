//! Typed key/value cache with expiry and quota-driven eviction.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::entry::{EntryMeta, EntryType, SetOptions, StoredEntry};
use super::storage::{StorageBackend, StorageError};
use crate::clock::Clock;

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
  Stored,
  /// Stored, but other entries had to be evicted first. `unexpiring`
  /// counts evicted entries that had no TTL, such as unsynced offline records.
  StoredAfterEviction { evicted: usize, unexpiring: usize },
  /// Did not fit even after eviction; nothing was written
  Dropped { reason: String },
}

/// Running tally of one write's evictions.
#[derive(Debug, Default, Clone, Copy)]
struct Evicted {
  entries: usize,
  unexpiring: usize,
}

/// Summary of live (non-expired) cache contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
  pub total_items: usize,
  pub total_size: u64,
  pub by_type: BTreeMap<EntryType, usize>,
  pub quota: u64,
  pub usage: u64,
}

/// Cache store over a storage backend.
///
/// Reads never return expired entries: an expired entry found on read is
/// purged before answering "not found".
#[derive(Clone)]
pub struct CacheStore {
  backend: Arc<dyn StorageBackend>,
  clock: Arc<dyn Clock>,
}

impl CacheStore {
  pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
    Self { backend, clock }
  }

  /// Store or overwrite an entry, resetting its expiry.
  ///
  /// Quota pressure never surfaces as an error: the store evicts and
  /// retries once, and reports `Dropped` if the entry still does not fit.
  pub fn set<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    options: SetOptions,
  ) -> Result<StoreOutcome, StorageError> {
    let now = self.clock.now();
    let entry = StoredEntry {
      key: key.to_string(),
      entry_type: options.entry_type,
      value: serde_json::to_vec(value)?,
      created_at: now,
      expires_at: options.ttl.map(|ttl| now + ttl),
    };
    let size = entry.size_bytes();

    let estimate = self.backend.estimate()?;
    if size > estimate.quota {
      warn!(key, size, quota = estimate.quota, "entry larger than cache quota, dropping");
      return Ok(StoreOutcome::Dropped {
        reason: format!("entry of {} bytes exceeds quota of {}", size, estimate.quota),
      });
    }

    let mut evicted = Evicted::default();
    if estimate.is_approaching(size) {
      self.evict(estimate.excess_over_low_water(size), key, &mut evicted)?;
    }

    match self.backend.put(&entry) {
      Ok(()) => {}
      Err(StorageError::QuotaExceeded { needed, available }) => {
        warn!(key, needed, available, "cache quota exceeded, evicting and retrying");
        self.evict(needed.saturating_sub(available), key, &mut evicted)?;

        match self.backend.put(&entry) {
          Ok(()) => {}
          Err(StorageError::QuotaExceeded { needed, available }) => {
            warn!(key, needed, available, "cache write dropped after eviction");
            return Ok(StoreOutcome::Dropped {
              reason: format!("needed {} bytes, {} available", needed, available),
            });
          }
          Err(e) => return Err(e),
        }
      }
      Err(e) => return Err(e),
    }

    debug!(key, size, entry_type = %options.entry_type, "cached entry");
    Ok(if evicted.entries == 0 {
      StoreOutcome::Stored
    } else {
      StoreOutcome::StoredAfterEviction {
        evicted: evicted.entries,
        unexpiring: evicted.unexpiring,
      }
    })
  }

  /// Read an entry. Missing and expired entries are both `None`.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
    let Some(entry) = self.backend.get(key)? else {
      return Ok(None);
    };

    if entry.is_expired(self.clock.now()) {
      debug!(key, "purging expired entry on read");
      self.backend.delete(key)?;
      return Ok(None);
    }

    Ok(Some(serde_json::from_slice(&entry.value)?))
  }

  /// Remove an entry. Absent keys are not an error.
  pub fn delete(&self, key: &str) -> Result<(), StorageError> {
    self.backend.delete(key)?;
    Ok(())
  }

  /// Remove everything.
  pub fn clear(&self) -> Result<(), StorageError> {
    self.backend.clear()?;
    info!("cleared offline cache");
    Ok(())
  }

  /// Live entries of one type, decoded. Entries that fail to decode as `T` are skipped.
  pub fn entries_of_type<T: DeserializeOwned>(
    &self,
    entry_type: EntryType,
  ) -> Result<Vec<(String, T)>, StorageError> {
    let now = self.clock.now();
    let mut live = Vec::new();

    for entry in self.backend.entries_of_type(entry_type)? {
      if entry.is_expired(now) {
        self.backend.delete(&entry.key)?;
        continue;
      }
      match serde_json::from_slice(&entry.value) {
        Ok(value) => live.push((entry.key, value)),
        Err(e) => warn!(key = %entry.key, "skipping undecodable {} entry: {}", entry_type, e),
      }
    }

    Ok(live)
  }

  /// Evict every expired entry. Returns how many were removed.
  pub fn purge_expired(&self) -> Result<usize, StorageError> {
    let removed = self.backend.delete_expired(self.clock.now())?;
    if removed > 0 {
      debug!(removed, "purged expired cache entries");
    }
    Ok(removed)
  }

  /// Counts and sizes of live entries.
  pub fn storage_info(&self) -> Result<StorageInfo, StorageError> {
    self.purge_expired()?;

    let now = self.clock.now();
    let mut info = StorageInfo::default();
    for meta in self.backend.entries()? {
      if meta.is_expired(now) {
        continue;
      }
      info.total_items += 1;
      info.total_size += meta.size_bytes;
      *info.by_type.entry(meta.entry_type).or_insert(0) += 1;
    }

    let estimate = self.backend.estimate()?;
    info.quota = estimate.quota;
    info.usage = estimate.usage;
    Ok(info)
  }

  /// Free at least `bytes` by evicting entries other than `keep`.
  ///
  /// Expired entries go first, then the soonest to expire, then entries
  /// without a TTL from oldest to newest.
  fn evict(&self, bytes: u64, keep: &str, tally: &mut Evicted) -> Result<(), StorageError> {
    if bytes == 0 {
      return Ok(());
    }

    let now = self.clock.now();
    let mut candidates: Vec<EntryMeta> = self
      .backend
      .entries()?
      .into_iter()
      .filter(|meta| meta.key != keep)
      .collect();
    candidates.sort_by_key(|meta| match meta.expires_at {
      Some(at) if at <= now => (0, at.timestamp_millis()),
      Some(at) => (1, at.timestamp_millis()),
      None => (2, meta.created_at.timestamp_millis()),
    });

    let mut freed = 0;
    let mut evicted = 0;
    for meta in candidates {
      if freed >= bytes {
        break;
      }
      if self.backend.delete(&meta.key)? {
        if meta.expires_at.is_none() {
          // Offline records carry no TTL; losing one loses an unsynced write
          warn!(
            key = %meta.key,
            entry_type = %meta.entry_type,
            "evicted entry without expiry under quota pressure"
          );
          tally.unexpiring += 1;
        } else {
          debug!(key = %meta.key, size = meta.size_bytes, "evicted cache entry");
        }
        freed += meta.size_bytes;
        evicted += 1;
      }
    }

    tally.entries += evicted;
    info!(evicted, freed, requested = bytes, "cache eviction finished");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::clock::ManualClock;
  use crate::db::Database;
  use chrono::Duration;
  use pretty_assertions::assert_eq;
  use serde_json::{json, Value};

  fn store(quota: u64) -> (CacheStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let backend = SqliteStorage::new(Database::open_in_memory().unwrap(), "test", quota);
    (CacheStore::new(Arc::new(backend), clock.clone()), clock)
  }

  #[test]
  fn test_value_visible_until_ttl_elapses() {
    let (store, clock) = store(1 << 20);
    let opts = SetOptions::default().with_ttl(Duration::seconds(60));
    store.set("k", &json!({"a": 1}), opts).unwrap();

    clock.advance(Duration::seconds(59));
    assert_eq!(store.get::<Value>("k").unwrap(), Some(json!({"a": 1})));

    clock.advance(Duration::seconds(1));
    assert_eq!(store.get::<Value>("k").unwrap(), None);
  }

  #[test]
  fn test_expired_read_purges_entry() {
    let (store, clock) = store(1 << 20);
    store
      .set("k", &1, SetOptions::default().with_ttl(Duration::seconds(1)))
      .unwrap();
    clock.advance(Duration::seconds(5));

    assert_eq!(store.get::<i32>("k").unwrap(), None);
    assert!(store.backend.get("k").unwrap().is_none());
  }

  #[test]
  fn test_overwrite_resets_expiry() {
    let (store, clock) = store(1 << 20);
    let opts = SetOptions::default().with_ttl(Duration::seconds(10));
    store.set("k", &1, opts).unwrap();
    clock.advance(Duration::seconds(8));
    store.set("k", &2, opts).unwrap();
    clock.advance(Duration::seconds(8));

    assert_eq!(store.get::<i32>("k").unwrap(), Some(2));
  }

  #[test]
  fn test_delete_missing_key_is_ok() {
    let (store, _) = store(1 << 20);
    store.delete("nope").unwrap();
    store.set("k", "v", SetOptions::default()).unwrap();
    store.delete("k").unwrap();
    assert_eq!(store.get::<String>("k").unwrap(), None);
  }

  #[test]
  fn test_clear_resets_storage_info() {
    let (store, _) = store(1 << 20);
    store.set("t", &json!({}), SetOptions::typed(EntryType::Trip)).unwrap();
    store.set("b", &json!({}), SetOptions::typed(EntryType::Booking)).unwrap();
    store.set("g", &json!({}), SetOptions::default()).unwrap();

    store.clear().unwrap();

    let info = store.storage_info().unwrap();
    assert_eq!(info.total_items, 0);
    assert_eq!(info.total_size, 0);
    assert!(info.by_type.is_empty());
    assert_eq!(info.usage, 0);
  }

  #[test]
  fn test_storage_info_ignores_expired_entries() {
    let (store, clock) = store(1 << 20);
    store.set("t1", &1, SetOptions::typed(EntryType::Trip)).unwrap();
    store
      .set(
        "t2",
        &2,
        SetOptions::typed(EntryType::Trip).with_ttl(Duration::seconds(5)),
      )
      .unwrap();
    store.set("c", &3, SetOptions::typed(EntryType::ContactSet)).unwrap();
    clock.advance(Duration::seconds(5));

    let info = store.storage_info().unwrap();
    assert_eq!(info.total_items, 2);
    assert_eq!(info.total_size, 5); // "t1" + "1", "c" + "3"
    assert_eq!(info.by_type.get(&EntryType::Trip), Some(&1));
    assert_eq!(info.by_type.get(&EntryType::ContactSet), Some(&1));
  }

  #[test]
  fn test_eviction_drops_soonest_to_expire_first() {
    // Each entry is 2 + 50 = 52 bytes; quota 200 leaves room for three.
    let (store, _) = store(200);
    let payload = "x".repeat(48); // serialized with quotes: 50 bytes
    let long = SetOptions::default().with_ttl(Duration::hours(10));
    let short = SetOptions::default().with_ttl(Duration::hours(1));

    store.set("k1", &payload, SetOptions::default()).unwrap();
    store.set("k2", &payload, long).unwrap();
    store.set("k3", &payload, short).unwrap();
    let outcome = store.set("k4", &payload, long).unwrap();

    assert!(matches!(outcome, StoreOutcome::StoredAfterEviction { .. }));
    assert!(store.get::<String>("k3").unwrap().is_none());
    assert!(store.get::<String>("k1").unwrap().is_some());
    assert!(store.get::<String>("k4").unwrap().is_some());
  }

  #[test]
  fn test_entries_without_ttl_are_evicted_last_oldest_first() {
    let (store, clock) = store(200);
    let payload = "x".repeat(48);

    store.set("old", &payload, SetOptions::default()).unwrap();
    clock.advance(Duration::seconds(1));
    store.set("new", &payload, SetOptions::default()).unwrap();
    clock.advance(Duration::seconds(1));
    store
      .set("ttl", &payload, SetOptions::default().with_ttl(Duration::days(365)))
      .unwrap();
    // Needs two evictions' worth of room to reach the low-water mark.
    let outcome = store.set("big", &"y".repeat(98), SetOptions::default()).unwrap();

    assert_eq!(
      outcome,
      StoreOutcome::StoredAfterEviction {
        evicted: 2,
        unexpiring: 1
      }
    );
    assert!(store.get::<String>("ttl").unwrap().is_none());
    assert!(store.get::<String>("old").unwrap().is_none());
    assert!(store.get::<String>("new").unwrap().is_some());
    assert!(store.get::<String>("big").unwrap().is_some());
  }

  #[test]
  fn test_oversized_entry_is_dropped_not_an_error() {
    let (store, _) = store(20);
    store.set("small", &1, SetOptions::default()).unwrap();

    let outcome = store.set("huge", &"z".repeat(64), SetOptions::default()).unwrap();

    assert!(matches!(outcome, StoreOutcome::Dropped { .. }));
    assert_eq!(store.get::<i32>("small").unwrap(), Some(1));
    assert_eq!(store.get::<String>("huge").unwrap(), None);
  }

  /// Backend whose next `n` puts report a full quota.
  struct QuotaFailingBackend {
    inner: SqliteStorage,
    failures: std::sync::Mutex<u32>,
  }

  impl QuotaFailingBackend {
    fn fail_next_puts(&self, n: u32) {
      *self.failures.lock().unwrap() = n;
    }
  }

  impl StorageBackend for QuotaFailingBackend {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
      self.inner.get(key)
    }

    fn put(&self, entry: &StoredEntry) -> Result<(), StorageError> {
      let mut left = self.failures.lock().unwrap();
      if *left > 0 {
        *left -= 1;
        let needed = entry.size_bytes();
        return Err(StorageError::QuotaExceeded {
          needed,
          available: needed - 1,
        });
      }
      drop(left);
      self.inner.put(entry)
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
      self.inner.delete(key)
    }

    fn clear(&self) -> Result<(), StorageError> {
      self.inner.clear()
    }

    fn entries(&self) -> Result<Vec<EntryMeta>, StorageError> {
      self.inner.entries()
    }

    fn entries_of_type(&self, entry_type: EntryType) -> Result<Vec<StoredEntry>, StorageError> {
      self.inner.entries_of_type(entry_type)
    }

    fn delete_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize, StorageError> {
      self.inner.delete_expired(now)
    }

    fn estimate(&self) -> Result<crate::cache::storage::StorageEstimate, StorageError> {
      self.inner.estimate()
    }
  }

  fn failing_store() -> (CacheStore, Arc<QuotaFailingBackend>) {
    let backend = Arc::new(QuotaFailingBackend {
      inner: SqliteStorage::new(Database::open_in_memory().unwrap(), "test", 1 << 20),
      failures: std::sync::Mutex::new(0),
    });
    let store = CacheStore::new(backend.clone(), Arc::new(ManualClock::new()));
    store
      .set("expiring", &1, SetOptions::default().with_ttl(Duration::hours(1)))
      .unwrap();
    store.set("kept", &2, SetOptions::default()).unwrap();
    (store, backend)
  }

  #[test]
  fn test_quota_error_is_retried_after_eviction() {
    let (store, backend) = failing_store();
    backend.fail_next_puts(1);

    let outcome = store.set("new", &3, SetOptions::default()).unwrap();

    assert_eq!(
      outcome,
      StoreOutcome::StoredAfterEviction {
        evicted: 1,
        unexpiring: 0
      }
    );
    assert_eq!(store.get::<i32>("new").unwrap(), Some(3));
    assert_eq!(store.get::<i32>("expiring").unwrap(), None);
    assert_eq!(store.get::<i32>("kept").unwrap(), Some(2));
  }

  #[test]
  fn test_write_is_dropped_when_retry_also_fails() {
    let (store, backend) = failing_store();
    backend.fail_next_puts(u32::MAX);

    let outcome = store.set("new", &3, SetOptions::default()).unwrap();

    assert!(matches!(outcome, StoreOutcome::Dropped { .. }));
    assert_eq!(store.get::<i32>("new").unwrap(), None);
    assert_eq!(store.get::<i32>("kept").unwrap(), Some(2));
  }

  #[test]
  fn test_entries_of_type_skips_expired_and_foreign_shapes() {
    let (store, clock) = store(1 << 20);
    store.set("a", &json!({"n": 1}), SetOptions::typed(EntryType::Trip)).unwrap();
    store
      .set(
        "b",
        &json!({"n": 2}),
        SetOptions::typed(EntryType::Trip).with_ttl(Duration::seconds(1)),
      )
      .unwrap();
    store.set("c", &"not an object", SetOptions::typed(EntryType::Trip)).unwrap();
    clock.advance(Duration::seconds(2));

    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct N {
      n: i32,
    }
    let live: Vec<(String, N)> = store.entries_of_type(EntryType::Trip).unwrap();
    assert_eq!(live, vec![("a".to_string(), N { n: 1 })]);
  }
}
