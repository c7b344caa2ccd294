//! Hands registered tasks back to their handler when the device is online.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{SyncTag, SyncTask, TaskError, TaskRegistry};
use crate::connectivity::ConnectivityMonitor;

/// Consumer of delivered tasks. Must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
  async fn handle(&self, task: &SyncTask) -> Result<(), TaskError>;
}

/// Outcome of one delivery round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
  pub delivered: usize,
  pub failed: usize,
  /// Left pending because connectivity dropped
  pub deferred: usize,
}

/// Delivery side of the registry.
///
/// A task is removed only after its handler succeeds, so a crash between
/// the two causes a redelivery rather than a loss.
pub struct TaskHost {
  registry: TaskRegistry,
  handler: Arc<dyn TaskHandler>,
  monitor: Arc<ConnectivityMonitor>,
}

impl TaskHost {
  pub fn new(
    registry: TaskRegistry,
    handler: Arc<dyn TaskHandler>,
    monitor: Arc<ConnectivityMonitor>,
  ) -> Self {
    Self {
      registry,
      handler,
      monitor,
    }
  }

  /// Deliver every pending task, in scheduling order.
  ///
  /// Handler failures are recorded on the task and do not stop the round.
  /// Tasks that fail for lack of connectivity stay pending for the next round.
  pub async fn deliver_pending(&self) -> Result<DeliveryReport, TaskError> {
    let mut report = DeliveryReport::default();
    if !self.monitor.is_online() {
      debug!("offline, holding background tasks");
      return Ok(report);
    }

    for task in self.registry.pending()? {
      let Some(id) = task.id else { continue };

      if !self.monitor.is_online() {
        report.deferred += 1;
        continue;
      }

      self.registry.record_attempt(id)?;
      match self.handler.handle(&task).await {
        Ok(()) => {
          self.registry.complete(id)?;
          report.delivered += 1;
          info!(id, tag = %task.tag, "delivered background task");
        }
        Err(e) if e.is_connectivity() => {
          debug!(id, tag = %task.tag, "connectivity lost during delivery: {}", e);
          report.deferred += 1;
        }
        Err(e) => {
          error!(id, tag = %task.tag, "background task handler failed: {}", e);
          self.registry.fail(id, &e.to_string())?;
          report.failed += 1;
        }
      }
    }

    Ok(report)
  }

  /// Deliver one occurrence of a periodic tag. Skipped while offline.
  pub async fn deliver_periodic(
    &self,
    tag: SyncTag,
    payload: serde_json::Value,
  ) -> Result<bool, TaskError> {
    if !self.monitor.is_online() {
      debug!(%tag, "offline, skipping periodic delivery");
      return Ok(false);
    }

    let task = SyncTask::periodic(tag, payload, self.registry.now());
    self.handler.handle(&task).await?;
    debug!(%tag, "delivered periodic task");
    Ok(true)
  }
}
