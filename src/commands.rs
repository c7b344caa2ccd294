//! Command-line surface over the engine.

use chrono::Duration;
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;

use crate::cache::{EntryType, SetOptions, StoreOutcome};
use crate::engine::OfflineEngine;
use crate::sync::{EntityKind, SyncOutcome};
use crate::tasks::SyncTag;

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
  /// Run the daemon: connectivity polling, auto-sync and task delivery
  Run,
  /// Run one sync pass now (no-op while offline)
  Sync,
  /// Show sync state and storage usage
  Status,
  /// Cache a JSON value
  Put {
    key: String,
    #[arg(value_parser = parse_json)]
    value: serde_json::Value,
    /// Expire after this many seconds
    #[arg(long, value_parser = parse_ttl)]
    ttl: Option<Duration>,
    /// Entry type used for storage accounting
    #[arg(long = "type", default_value = "generic")]
    entry_type: EntryType,
  },
  /// Print a cached value
  Get { key: String },
  /// Remove a cached value
  Delete { key: String },
  /// Remove all offline data
  Clear,
  /// Create a trip, booking or contact set while offline
  Create {
    kind: EntityKind,
    #[arg(value_parser = parse_json)]
    data: serde_json::Value,
  },
  /// List cached records of one kind
  List { kind: EntityKind },
  /// Register a background task
  Schedule {
    tag: SyncTag,
    #[arg(value_parser = parse_json)]
    payload: serde_json::Value,
  },
  /// List pending and failed tasks
  Tasks,
  /// Put a failed task back in the queue
  Retry { id: i64 },
}

fn parse_json(s: &str) -> Result<serde_json::Value, String> {
  serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e))
}

fn parse_ttl(s: &str) -> Result<Duration, String> {
  let secs: i64 = s
    .parse()
    .map_err(|_| format!("'{}' is not a number of seconds", s))?;
  if secs <= 0 {
    return Err("ttl must be positive".to_string());
  }
  Duration::try_seconds(secs).ok_or_else(|| format!("ttl {} is out of range", secs))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", out);
  Ok(())
}

#[derive(Serialize)]
struct StatusOutput {
  sync: crate::sync::SyncState,
  storage: crate::cache::StorageInfo,
  pending_tasks: usize,
  failed_tasks: usize,
}

#[derive(Serialize)]
struct TasksOutput {
  pending: Vec<crate::tasks::SyncTask>,
  failed: Vec<crate::tasks::SyncTask>,
}

/// Execute a one-shot command. `Run` is handled by the caller.
pub async fn execute(engine: &OfflineEngine, command: Command) -> Result<()> {
  match command {
    Command::Run => Err(eyre!("run is not a one-shot command")),
    Command::Sync => {
      match engine.sync_data().await {
        SyncOutcome::Completed(report) => print_json(&report)?,
        SyncOutcome::Coalesced => println!("A sync pass is already running"),
        SyncOutcome::Offline => println!("Offline, nothing synced"),
      }
      let status = engine.sync_status();
      for error in &status.sync_errors {
        eprintln!("sync error: {}", error);
      }
      Ok(())
    }
    Command::Status => print_json(&StatusOutput {
      sync: engine.sync_status(),
      storage: engine.storage_info()?,
      pending_tasks: engine.registry().pending()?.len(),
      failed_tasks: engine.registry().failed()?.len(),
    }),
    Command::Put {
      key,
      value,
      ttl,
      entry_type,
    } => {
      let mut options = SetOptions::typed(entry_type);
      if let Some(ttl) = ttl {
        options = options.with_ttl(ttl);
      }
      match engine.store_offline(&key, &value, options)? {
        StoreOutcome::Dropped { reason } => Err(eyre!("Write dropped: {}", reason)),
        StoreOutcome::StoredAfterEviction {
          evicted,
          unexpiring,
        } => {
          println!("Stored {} (evicted {} entries)", key, evicted);
          if unexpiring > 0 {
            eprintln!(
              "warning: {} evicted entries had no expiry and may have held unsynced data",
              unexpiring
            );
          }
          Ok(())
        }
        StoreOutcome::Stored => Ok(()),
      }
    }
    Command::Get { key } => match engine.get_offline::<serde_json::Value>(&key)? {
      Some(value) => print_json(&value),
      None => Err(eyre!("Not found: {}", key)),
    },
    Command::Delete { key } => Ok(engine.delete_offline(&key)?),
    Command::Clear => {
      engine.clear()?;
      println!("Offline data cleared");
      Ok(())
    }
    Command::Create { kind, data } => print_json(&engine.create_offline(kind, data)?),
    Command::List { kind } => print_json(&engine.cached_records(kind)?),
    Command::Schedule { tag, payload } => {
      let id = engine.schedule_sync(tag, payload)?;
      println!("Scheduled {} as task {}", tag, id);
      Ok(())
    }
    Command::Tasks => print_json(&TasksOutput {
      pending: engine.registry().pending()?,
      failed: engine.registry().failed()?,
    }),
    Command::Retry { id } => {
      engine.registry().reschedule(id)?;
      println!("Task {} rescheduled", id);
      Ok(())
    }
  }
}
