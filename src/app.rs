use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connectivity::{self, ConnectivityEvent, ConnectivityProbe, HttpProbe};
use crate::engine::OfflineEngine;
use crate::event::{Event, EventHandler};
use crate::tasks::SyncTag;

/// Cache key holding the most recent location fix
pub const LAST_LOCATION_KEY: &str = "location:last";

const TICK_RATE: Duration = Duration::from_secs(60);

/// Long-running host for the engine: reacts to connectivity, delivers tasks
pub struct App {
  engine: OfflineEngine,
  config: Config,
}

impl App {
  pub fn new(engine: OfflineEngine, config: Config) -> Self {
    Self { engine, config }
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new(TICK_RATE);
    events.watch_connectivity(self.engine.monitor().subscribe());
    events.watch_tasks(self.engine.registry().wakeup());
    if let Some(every) = self.config.tasks.location_update_interval() {
      events.forward_interval(every, Event::PeriodicLocation);
    }

    let probe: Arc<dyn ConnectivityProbe> = Arc::new(HttpProbe::new(
      self.config.probe_url()?,
      Duration::from_secs(self.config.remote.timeout_secs),
    )?);
    let poller = connectivity::spawn_polling(
      self.engine.monitor().clone(),
      probe,
      self.config.connectivity.poll_interval(),
    );

    info!(user = %self.config.remote.user_id, "daemon started");

    let mut status = self.engine.coordinator().subscribe_status();
    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => {
          info!("shutting down");
          break;
        }
        event = events.next() => match event {
          Some(event) => self.handle_event(event).await,
          None => break,
        },
        Ok(()) = status.changed() => {
          let state = status.borrow_and_update().clone();
          debug!(
            online = state.is_online,
            syncing = state.is_syncing,
            pending = state.pending_items,
            "sync state changed"
          );
        }
      }
    }

    poller.abort();
    Ok(())
  }

  async fn handle_event(&self, event: Event) {
    debug!(?event, "handling event");
    match event {
      Event::Connectivity(transition) => {
        info!(?transition, "connectivity changed");
        if let Some(outcome) = self.engine.coordinator().on_connectivity(transition).await {
          debug!(?outcome, "sync after reconnect");
        }
        if transition == ConnectivityEvent::WentOnline {
          self.deliver_tasks().await;
        }
      }
      Event::TasksScheduled => {
        if self.engine.monitor().is_online() {
          self.deliver_tasks().await;
        }
      }
      Event::Tick => match self.engine.purge_expired() {
        Ok(0) => {}
        Ok(purged) => info!(purged, "purged expired cache entries"),
        Err(e) => warn!("purge failed: {}", e),
      },
      Event::PeriodicLocation => self.deliver_location().await,
    }
  }

  async fn deliver_tasks(&self) {
    match self.engine.task_host().deliver_pending().await {
      Ok(report) => {
        if report.delivered + report.failed + report.deferred > 0 {
          info!(
            delivered = report.delivered,
            failed = report.failed,
            deferred = report.deferred,
            "task delivery round finished"
          );
        }
      }
      Err(e) => error!("task delivery failed: {}", e),
    }
  }

  async fn deliver_location(&self) {
    let location = match self.engine.get_offline::<serde_json::Value>(LAST_LOCATION_KEY) {
      Ok(Some(location)) if !location.is_null() => location,
      Ok(_) => {
        debug!("no location fix cached, skipping periodic update");
        return;
      }
      Err(e) => {
        warn!("reading last location failed: {}", e);
        return;
      }
    };

    if let Err(e) = self
      .engine
      .task_host()
      .deliver_periodic(SyncTag::LocationUpdate, location)
      .await
    {
      warn!("periodic location update failed: {}", e);
    }
  }
}
