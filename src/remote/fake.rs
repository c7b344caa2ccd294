//! In-process remote used by tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{RemoteDataSource, RemoteError};
use crate::sync::{EntityKind, Record, RecordId};
use crate::tasks::{SyncTask, TaskDispatcher};

#[derive(Default)]
pub struct FakeRemote {
  rows: Mutex<HashMap<EntityKind, Vec<Record>>>,
  next_id: Mutex<u32>,
  /// Local ids whose push is rejected
  reject: Mutex<HashSet<String>>,
  /// Kinds whose listing fails as if offline
  unreachable: Mutex<HashSet<EntityKind>>,
  pub pushes: Mutex<Vec<Record>>,
  pub list_calls: Mutex<usize>,
  pub dispatched: Mutex<Vec<SyncTask>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed an existing remote row.
  pub fn insert(&self, record: Record) {
    self.rows.lock().unwrap().entry(record.kind).or_default().push(record);
  }

  pub fn reject_push_of(&self, local_id: &str) {
    self.reject.lock().unwrap().insert(local_id.to_string());
  }

  pub fn allow_all_pushes(&self) {
    self.reject.lock().unwrap().clear();
  }

  pub fn make_unreachable(&self, kind: EntityKind) {
    self.unreachable.lock().unwrap().insert(kind);
  }

  pub fn rows(&self, kind: EntityKind) -> Vec<Record> {
    self.rows.lock().unwrap().get(&kind).cloned().unwrap_or_default()
  }

  pub fn push_count(&self) -> usize {
    self.pushes.lock().unwrap().len()
  }
}

#[async_trait]
impl RemoteDataSource for FakeRemote {
  async fn list_by_user(
    &self,
    kind: EntityKind,
    user_id: &str,
  ) -> Result<Vec<Record>, RemoteError> {
    // Suspend like a real network call would
    tokio::task::yield_now().await;
    *self.list_calls.lock().unwrap() += 1;

    if self.unreachable.lock().unwrap().contains(&kind) {
      return Err(RemoteError::Connectivity("connection refused".into()));
    }
    Ok(
      self
        .rows(kind)
        .into_iter()
        .filter(|r| r.user_id == user_id)
        .collect(),
    )
  }

  async fn create(&self, record: &Record) -> Result<Record, RemoteError> {
    tokio::task::yield_now().await;
    self.pushes.lock().unwrap().push(record.clone());

    let local_id = record.id.value().to_string();
    if self.reject.lock().unwrap().contains(&local_id) {
      return Err(RemoteError::Rejected {
        status: 422,
        message: format!("invalid record {}", local_id),
      });
    }

    let id = {
      let mut next = self.next_id.lock().unwrap();
      *next += 1;
      format!("R{}", *next)
    };
    let created = Record {
      id: RecordId::Remote(id),
      client_ref: Some(local_id),
      ..record.clone()
    };
    self.insert(created.clone());
    Ok(created)
  }
}

#[async_trait]
impl TaskDispatcher for FakeRemote {
  async fn dispatch(&self, task: &SyncTask) -> Result<(), RemoteError> {
    tokio::task::yield_now().await;
    self.dispatched.lock().unwrap().push(task.clone());
    Ok(())
  }
}
