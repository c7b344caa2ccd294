//! Online/offline tracking with a push-style transition stream.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use url::Url;

/// A change in connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  WentOnline,
  WentOffline,
}

/// Tracks the current connectivity state and publishes transitions.
///
/// A transition is published only when the reported state differs from the
/// current one, so subscribers never see two events for a stable state.
pub struct ConnectivityMonitor {
  online: AtomicBool,
  events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      online: AtomicBool::new(initially_online),
      events,
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::Acquire)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.events.subscribe()
  }

  /// Feed a platform reading. Returns the transition it caused, if any.
  pub fn report(&self, online: bool) -> Option<ConnectivityEvent> {
    let was_online = self.online.swap(online, Ordering::AcqRel);
    if was_online == online {
      return None;
    }

    let event = if online {
      ConnectivityEvent::WentOnline
    } else {
      ConnectivityEvent::WentOffline
    };
    info!(?event, "connectivity changed");
    // No subscribers is fine
    let _ = self.events.send(event);
    Some(event)
  }
}

/// Platform connectivity signal.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
  async fn is_reachable(&self) -> bool;
}

/// Probe that treats any HTTP response from the remote as "online".
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> reqwest::Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, url })
  }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
  async fn is_reachable(&self) -> bool {
    match self.client.head(self.url.clone()).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!("connectivity probe failed: {}", e);
        false
      }
    }
  }
}

/// Poll `probe` every `every` and feed the result into `monitor`.
///
/// Fallback for hosts without a native connectivity signal.
pub fn spawn_polling(
  monitor: Arc<ConnectivityMonitor>,
  probe: Arc<dyn ConnectivityProbe>,
  every: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      interval.tick().await;
      let online = probe.is_reachable().await;
      monitor.report(online);
    }
  })
}
