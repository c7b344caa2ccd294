use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::MissedTickBehavior;

use crate::connectivity::ConnectivityEvent;

/// Daemon events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Connectivity transition from the monitor
  Connectivity(ConnectivityEvent),
  /// A task was scheduled and may be deliverable
  TasksScheduled,
  /// Periodic housekeeping
  Tick,
  /// The periodic `location-update` interval elapsed
  PeriodicLocation,
}

/// Event handler that merges every daemon event source into one stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Self { tx, rx };
    handler.forward_interval(tick_rate, Event::Tick);
    handler
  }

  /// Forward connectivity transitions
  pub fn watch_connectivity(&self, mut events: broadcast::Receiver<ConnectivityEvent>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(event) => {
            if tx.send(Event::Connectivity(event)).is_err() {
              break;
            }
          }
          // Only the latest transition matters
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
  }

  /// Forward task registry wakeups
  pub fn watch_tasks(&self, wakeup: Arc<Notify>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      loop {
        wakeup.notified().await;
        if tx.send(Event::TasksScheduled).is_err() {
          break;
        }
      }
    });
  }

  /// Emit `event` every `every`, skipping the immediate first tick
  pub fn forward_interval(&self, every: Duration, event: Event) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      interval.tick().await;
      loop {
        interval.tick().await;
        if tx.send(event).is_err() {
          break;
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
