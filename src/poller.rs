//! Background interface counter polling
//!
//! The poller owns one task that reads `stats` for every tracked interface
//! through the service and broadcasts an event whenever the counters moved.
//! Nothing is polled while nobody is subscribed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::driver::InterfaceStats;
use crate::error::{WgctlError, WgctlResult};
use crate::service::{BackendTarget, WireguardService};

const EVENT_CAPACITY: usize = 100;

/// One interface to poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsTarget {
    pub backend: BackendTarget,
    pub interface: String,
}

impl StatsTarget {
    fn key(&self) -> (String, String) {
        (self.backend.id.clone(), self.interface.clone())
    }
}

/// Counters changed (or the interface appeared or vanished)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsEvent {
    pub backend_id: String,
    pub interface: String,
    /// `None` when the interface no longer exists
    pub stats: Option<InterfaceStats>,
    pub observed_at: DateTime<Utc>,
}

struct Shared {
    service: Arc<WireguardService>,
    targets: RwLock<Vec<StatsTarget>>,
    last: Mutex<HashMap<(String, String), Option<InterfaceStats>>>,
    events: broadcast::Sender<StatsEvent>,
    subscribers: AtomicUsize,
}

impl Shared {
    async fn poll(&self) -> usize {
        if self.subscribers.load(Ordering::SeqCst) == 0 {
            return 0;
        }

        let targets = self.targets.read().await.clone();
        let mut published = 0;
        for target in targets {
            let stats = match self.service.stats(&target.backend, &target.interface).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(
                        "Failed to read stats for {} on {}: {}",
                        target.interface, target.backend.id, e
                    );
                    continue;
                }
            };

            let changed = {
                let mut last = self.last.lock().await;
                match last.insert(target.key(), stats) {
                    Some(previous) => previous != stats,
                    None => true,
                }
            };
            if !changed {
                continue;
            }

            let event = StatsEvent {
                backend_id: target.backend.id.clone(),
                interface: target.interface.clone(),
                stats,
                observed_at: Utc::now(),
            };
            // Only fails when every receiver is gone between the check and the send
            if self.events.send(event).is_ok() {
                published += 1;
            }
        }
        published
    }
}

/// Receiving end handed to a subscriber; dropping it unsubscribes
pub struct StatsSubscription {
    receiver: broadcast::Receiver<StatsEvent>,
    shared: Arc<Shared>,
}

impl StatsSubscription {
    /// Next event, `None` once the poller has shut down
    pub async fn recv(&mut self) -> Option<StatsEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Stats subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for StatsSubscription {
    fn drop(&mut self) {
        self.shared.subscribers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct StatsPoller {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatsPoller {
    /// Spawn the polling task
    pub fn start(service: Arc<WireguardService>, interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            service,
            targets: RwLock::new(Vec::new()),
            last: Mutex::new(HashMap::new()),
            events,
            subscribers: AtomicUsize::new(0),
        });
        let (shutdown, mut stop) = watch::channel(false);

        info!("Starting stats poller every {:?}", interval);
        let worker = shared.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let published = worker.poll().await;
                        if published > 0 {
                            debug!("Published {} stats events", published);
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Stats poller stopped");
        });

        Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn track(&self, target: StatsTarget) {
        let mut targets = self.shared.targets.write().await;
        if !targets.contains(&target) {
            debug!("Tracking {} on {}", target.interface, target.backend.id);
            targets.push(target);
        }
    }

    pub async fn untrack(&self, backend_id: &str, interface: &str) {
        self.shared
            .targets
            .write()
            .await
            .retain(|t| !(t.backend.id == backend_id && t.interface == interface));
        self.shared
            .last
            .lock()
            .await
            .remove(&(backend_id.to_string(), interface.to_string()));
    }

    pub async fn targets(&self) -> Vec<StatsTarget> {
        self.shared.targets.read().await.clone()
    }

    pub fn subscribe(&self) -> StatsSubscription {
        let receiver = self.shared.events.subscribe();
        self.shared.subscribers.fetch_add(1, Ordering::SeqCst);
        StatsSubscription {
            receiver,
            shared: self.shared.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load(Ordering::SeqCst)
    }

    /// Run one polling round immediately; returns the number of events sent
    pub async fn poll_now(&self) -> usize {
        self.shared.poll().await
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(&self) -> WgctlResult<()> {
        // Receiver already gone means the task has exited
        let _ = self.shutdown.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await
                .map_err(|e| WgctlError::Transport(format!("stats poller task failed: {}", e)))?;
            info!("Stats poller shut down");
        }
        Ok(())
    }
}
