use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vigil_core::{keys, Message, MessageNotice, MessageType, VigilError, VigilResult};
use vigil_store::{Delivery, Store, Subscription};

/// Messages expire a day after they are sent unless configured otherwise.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Receives every dispatched message of the types it was registered for.
///
/// Delivery is at-least-once: a listener that reconnects may see the same
/// `message_id` again, so implementations must tolerate repeats.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> VigilResult<()>;
}

type HandlerMap = HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>;

/// Store-backed message bus: persist, then notify on `agent_messages`.
pub struct MessageBus {
    store: Arc<dyn Store>,
    handlers: Arc<RwLock<HandlerMap>>,
    ttl: Duration,
}

impl MessageBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_ttl(store, DEFAULT_MESSAGE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Persist `message` and announce it to listeners.
    pub async fn send(&self, message: Message) -> VigilResult<Uuid> {
        if message.sender_id.trim().is_empty() {
            return Err(VigilError::validation("sender_id must not be empty"));
        }

        let json = serde_json::to_string(&message)?;
        self.store
            .set(&keys::message(message.message_id), &json, Some(self.ttl))
            .await?;

        let notice = MessageNotice {
            message_id: message.message_id,
            message_type: message.message_type(),
        };
        self.store
            .publish(keys::AGENT_MESSAGES_CHANNEL, &serde_json::to_string(&notice)?)
            .await?;

        debug!(
            message_id = %message.message_id,
            message_type = %notice.message_type,
            sender = %message.sender_id,
            recipient = ?message.recipient_id,
            "Message sent"
        );
        Ok(message.message_id)
    }

    /// Add a handler for `message_type`. Handlers of one type run in
    /// registration order.
    pub async fn register_handler(
        &self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) {
        let mut handlers = self.handlers.write().await;
        let list = handlers.entry(message_type).or_default();
        list.push(handler);
        info!(message_type = %message_type, handlers = list.len(), "Message handler registered");
    }

    pub async fn get(&self, message_id: Uuid) -> VigilResult<Message> {
        fetch(self.store.as_ref(), message_id)
            .await?
            .ok_or_else(|| VigilError::not_found(format!("message {message_id}")))
    }

    /// Messages sent by or addressed to `agent_id`, newest first.
    pub async fn messages_for_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> VigilResult<Vec<Message>> {
        let mut found = Vec::new();
        for key in self.store.keys(keys::MESSAGE_PREFIX).await? {
            let Some(id) = keys::parse_id(&key, keys::MESSAGE_PREFIX) else {
                continue;
            };
            if let Some(message) = fetch(self.store.as_ref(), id).await? {
                if message.involves(agent_id) {
                    found.push(message);
                }
            }
        }
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found.truncate(limit);
        Ok(found)
    }

    /// Subscribe to bus notifications. Only messages sent after this call
    /// are dispatched by the returned listener.
    pub async fn listener(&self) -> VigilResult<BusListener> {
        let subscription = self.store.subscribe(keys::AGENT_MESSAGES_CHANNEL).await?;
        Ok(BusListener {
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            subscription,
        })
    }
}

async fn fetch(store: &dyn Store, message_id: Uuid) -> VigilResult<Option<Message>> {
    match store.get(&keys::message(message_id)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Outcome counters of one [`BusListener::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages handed to at least one handler.
    pub dispatched: usize,
    /// Successful handler invocations.
    pub deliveries: usize,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: usize,
    /// Messages with no handler for their type; they stay in the store.
    pub unrouted: usize,
    /// Notices that were malformed or whose message had expired.
    pub skipped: usize,
}

impl DispatchReport {
    fn merge(&mut self, other: &DispatchReport) {
        self.dispatched += other.dispatched;
        self.deliveries += other.deliveries;
        self.handler_failures += other.handler_failures;
        self.unrouted += other.unrouted;
        self.skipped += other.skipped;
    }
}

/// Owns a subscription to `agent_messages` and dispatches each notice to
/// the handlers registered on its [`MessageBus`].
///
/// A listener processes one message fully before the next, so messages of
/// one sender reach handlers in send order.
pub struct BusListener {
    store: Arc<dyn Store>,
    handlers: Arc<RwLock<HandlerMap>>,
    subscription: Subscription,
}

impl BusListener {
    /// Dispatch every notice already received, without waiting for more.
    pub async fn drain(&mut self) -> VigilResult<DispatchReport> {
        let mut report = DispatchReport::default();
        while let Some(raw) = self.subscription.try_recv() {
            report.merge(&self.dispatch(&raw).await?);
        }
        Ok(report)
    }

    /// Dispatch notices as they arrive until `cancel` fires or the
    /// subscription closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Message listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.subscription.next_delivery() => {
                    let raw = match next {
                        Some(Delivery::Payload(raw)) => raw,
                        Some(Delivery::Resubscribed) => {
                            warn!("Message subscription re-established; messages sent meanwhile are only reachable by polling");
                            continue;
                        }
                        None => {
                            warn!("Message subscription closed");
                            break;
                        }
                    };
                    if let Err(e) = self.dispatch(&raw).await {
                        warn!(error = %e, "Message dispatch failed");
                    }
                }
            }
        }
        info!("Message listener stopped");
    }

    async fn dispatch(&self, raw: &str) -> VigilResult<DispatchReport> {
        let mut report = DispatchReport::default();

        let notice: MessageNotice = match serde_json::from_str(raw) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed bus notice");
                report.skipped += 1;
                return Ok(report);
            }
        };
        let Some(message) = fetch(self.store.as_ref(), notice.message_id).await? else {
            warn!(message_id = %notice.message_id, "Notified message no longer stored");
            report.skipped += 1;
            return Ok(report);
        };

        let handlers = self
            .handlers
            .read()
            .await
            .get(&message.message_type())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(message_id = %message.message_id, message_type = %message.message_type(), "No handler; message left for polling");
            report.unrouted += 1;
            return Ok(report);
        }

        report.dispatched += 1;
        for handler in handlers {
            match AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => report.deliveries += 1,
                Ok(Err(e)) => {
                    warn!(message_id = %message.message_id, error = %e, "Message handler failed");
                    report.handler_failures += 1;
                }
                Err(_) => {
                    error!(message_id = %message.message_id, "Message handler panicked");
                    report.handler_failures += 1;
                }
            }
        }
        Ok(report)
    }
}
