use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::{LifecycleEvent, VigilResult};
use vigil_store::Subscription;

/// Outbound frames buffered per observer before it counts as unresponsive.
pub const DEFAULT_BUFFER: usize = 64;

/// Fans lifecycle events out to connected observers.
///
/// Each connection gets a bounded buffer. A broadcast never waits on an
/// observer: one whose buffer is full or closed is disconnected and must
/// resynchronize through the query API when it reconnects.
pub struct EventNotifier {
    connections: RwLock<HashMap<Uuid, mpsc::Sender<String>>>,
    buffer: usize,
}

impl EventNotifier {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        })
    }

    /// Register an observer. Frames for it arrive on the returned receiver.
    pub async fn connect(&self) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        self.connections.write().await.insert(id, tx);
        info!(connection_id = %id, "Observer connected");
        (id, rx)
    }

    pub async fn disconnect(&self, id: Uuid) -> bool {
        let removed = self.connections.write().await.remove(&id).is_some();
        if removed {
            info!(connection_id = %id, "Observer disconnected");
        }
        removed
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn broadcast(&self, event: &LifecycleEvent) -> VigilResult<usize> {
        let payload = event.to_json()?;
        Ok(self.broadcast_raw(&payload).await)
    }

    /// Deliver `payload` to every observer. Returns how many accepted it.
    pub async fn broadcast_raw(&self, payload: &str) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, tx) in connections.iter() {
                match tx.try_send(payload.to_string()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(connection_id = %id, "Observer not keeping up; dropping connection");
                        stale.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => stale.push(*id),
                }
            }
        }

        if !stale.is_empty() {
            let mut connections = self.connections.write().await;
            for id in stale {
                connections.remove(&id);
                info!(connection_id = %id, "Observer removed");
            }
        }
        debug!(delivered, "Event broadcast");
        delivered
    }

    /// Relay every payload from `task_updates` until `cancel` fires. A
    /// resubscribed store keeps the relay going; events published during
    /// the gap are not replayed.
    pub async fn run(&self, mut subscription: Subscription, cancel: CancellationToken) {
        info!(channel = subscription.channel(), "Event notifier relaying");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = subscription.recv() => {
                    let Some(payload) = next else {
                        warn!("Event subscription closed");
                        break;
                    };
                    self.broadcast_raw(&payload).await;
                }
            }
        }
        info!("Event notifier stopped");
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            buffer: DEFAULT_BUFFER,
        }
    }
}
