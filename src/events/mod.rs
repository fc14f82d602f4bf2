//! Upward notifications from the manager to the host application.
//!
//! Events travel over a typed [`broadcast`] channel: every subscriber sees
//! every event published after it subscribed, in publish order. The
//! [`NetworkMonitor`] guarantees that online/offline events fire once per
//! actual transition rather than once per fetch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::fetch::{FetchFuture, Fetcher};
use crate::http::Request;

/// A one-shot notification for the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerEvent {
    /// A new version is installed and waiting to take over.
    UpdateAvailable,
    NetworkOnline,
    NetworkOffline,
    /// The host may offer an install prompt. Published by host glue, never by the manager.
    InstallAvailable,
    /// The first version of the application finished activating.
    AppInstalled,
}

impl ManagerEvent {
    /// Human-readable message carried with the event.
    pub fn message(self) -> &'static str {
        match self {
            Self::UpdateAvailable => "A new version is available",
            Self::NetworkOnline => "Back online",
            Self::NetworkOffline => "You are offline",
            Self::InstallAvailable => "The app can be installed",
            Self::AppInstalled => "The app is installed and ready for offline use",
        }
    }
}

/// Fan-out channel for [`ManagerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ManagerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Events buffered per lagging subscriber before the oldest are dropped.
    pub const DEFAULT_CAPACITY: usize = 32;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }

    /// Publishes `event`, returning how many subscribers it reached.
    pub fn publish(&self, event: ManagerEvent) -> usize {
        info!(?event, message = event.message(), "event");
        self.tx.send(event).unwrap_or(0)
    }
}

/// Tracks network reachability from fetch outcomes.
///
/// Starts out online. Only a change of state publishes an event.
#[derive(Debug)]
pub struct NetworkMonitor {
    online: AtomicBool,
    events: EventBus,
}

impl NetworkMonitor {
    pub fn new(events: EventBus) -> Self {
        Self {
            online: AtomicBool::new(true),
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Records whether the network was just reachable, returning the event
    /// published if this was a transition.
    pub fn record(&self, reachable: bool) -> Option<ManagerEvent> {
        let was = self.online.swap(reachable, Ordering::AcqRel);
        if was == reachable {
            return None;
        }
        let event = if reachable {
            ManagerEvent::NetworkOnline
        } else {
            ManagerEvent::NetworkOffline
        };
        self.events.publish(event);
        Some(event)
    }
}

/// A [`Fetcher`] that reports every outcome to a [`NetworkMonitor`].
pub struct MonitoredFetcher {
    inner: Arc<dyn Fetcher>,
    monitor: Arc<NetworkMonitor>,
}

impl MonitoredFetcher {
    pub fn new(inner: Arc<dyn Fetcher>, monitor: Arc<NetworkMonitor>) -> Self {
        Self { inner, monitor }
    }
}

impl Fetcher for MonitoredFetcher {
    fn fetch(&self, request: Request) -> FetchFuture<'_> {
        Box::pin(async move {
            let result = self.inner.fetch(request).await;
            if let Err(e) = &result {
                debug!(error = %e, "network fetch failed");
            }
            self.monitor.record(result.is_ok());
            result
        })
    }
}
