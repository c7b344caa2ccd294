//! Offline records and their reconciliation with the remote data service.
//!
//! Records created without connectivity live in the cache under a local id.
//! A sync pass pulls each entity type from the remote, caches what it finds
//! and pushes whatever was created locally, one entity type at a time.

mod coordinator;
mod record;
mod state;

pub use coordinator::{SyncCoordinator, SyncSettings};
pub use record::{EntityKind, Record, RecordId};
pub use state::{SyncOutcome, SyncState};
