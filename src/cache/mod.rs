//! Offline key/value cache.
//!
//! Entries are typed for accounting, may carry a TTL, and live in a
//! quota-bounded storage backend:
//! - Expired entries are never returned; reads purge them lazily
//! - Writes that approach the quota evict the soonest-to-expire entries first
//! - Quota failures are retried once after eviction and never propagate as errors

mod entry;
mod storage;
mod store;

pub use entry::{EntryType, SetOptions};
pub use storage::{SqliteStorage, StorageError};
pub use store::{CacheStore, StorageInfo, StoreOutcome};
