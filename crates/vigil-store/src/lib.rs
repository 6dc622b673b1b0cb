//! Shared store abstraction for Vigil.
//!
//! Every component receives an `Arc<dyn Store>` in its constructor. The
//! store provides the handful of primitives the engine relies on: plain
//! key/value records, an atomic create (`set_if_absent`), sets, priority
//! queues with an atomic pop, and publish/subscribe.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process fake used by tests and single-process runs.
//! - [`RedisStore`] (feature `redis`): the crash-durable store shared by
//!   separate orchestrator, agent and observer processes.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use vigil_core::VigilResult;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> VigilResult<Option<String>>;
    /// Writes `value`, replacing any previous one. `ttl` expires the key.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> VigilResult<()>;
    /// Atomically creates `key`. Returns false if it already existed.
    async fn set_if_absent(&self, key: &str, value: &str) -> VigilResult<bool>;
    async fn delete(&self, key: &str) -> VigilResult<bool>;
    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> VigilResult<Vec<String>>;

    async fn set_add(&self, key: &str, member: &str) -> VigilResult<()>;
    async fn set_remove(&self, key: &str, member: &str) -> VigilResult<()>;
    async fn set_members(&self, key: &str) -> VigilResult<Vec<String>>;

    /// Inserts `member` into a priority queue. Higher priority pops first;
    /// equal priorities pop in insertion order.
    async fn queue_push(&self, queue: &str, member: &str, priority: u8) -> VigilResult<()>;
    /// Atomically removes and returns the head of the queue. Each pushed
    /// member is returned to exactly one caller.
    async fn queue_pop(&self, queue: &str) -> VigilResult<Option<String>>;
    async fn queue_len(&self, queue: &str) -> VigilResult<usize>;

    async fn publish(&self, channel: &str, payload: &str) -> VigilResult<()>;
    /// Subscribes to `channel`. Only payloads published after this call are seen.
    async fn subscribe(&self, channel: &str) -> VigilResult<Subscription>;

    async fn ping(&self) -> bool;
}

/// One item of a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Payload(String),
    /// The backend lost its connection and subscribed again. Payloads
    /// published in between were not delivered.
    Resubscribed,
}

/// Stream of payloads published on one channel, in publish order.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next delivery, including reconnect markers. `None` once
    /// the store side has gone away.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Waits for the next payload, skipping reconnect markers.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await? {
                Delivery::Payload(payload) => return Some(payload),
                Delivery::Resubscribed => continue,
            }
        }
    }

    /// Next payload already delivered, without waiting. Reconnect markers
    /// are skipped.
    pub fn try_recv(&mut self) -> Option<String> {
        loop {
            match self.rx.try_recv().ok()? {
                Delivery::Payload(payload) => return Some(payload),
                Delivery::Resubscribed => continue,
            }
        }
    }
}
