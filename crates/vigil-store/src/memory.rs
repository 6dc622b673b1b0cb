use crate::{Delivery, Store, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;
use vigil_core::{VigilError, VigilResult};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: u8,
    seq: u64,
    member: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the older insertion.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    values: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, BinaryHeap<QueueEntry>>,
    seq: u64,
}

/// In-process [`Store`]. All primitives are atomic under a single mutex.
pub struct MemoryStore {
    state: Mutex<State>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>,
    offline: AtomicBool,
    value_writes_fail: AtomicBool,
    publish_fails: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            subscribers: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            value_writes_fail: AtomicBool::new(false),
            publish_fails: AtomicBool::new(false),
        }
    }

    /// While offline, every primitive fails with `TransientStore`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// While set, `set`, `set_if_absent` and `delete` fail with
    /// `TransientStore`; everything else keeps working.
    pub fn fail_value_writes(&self, fail: bool) {
        self.value_writes_fail.store(fail, AtomicOrdering::SeqCst);
    }

    /// While set, `publish` fails with `TransientStore`.
    pub fn fail_publish(&self, fail: bool) {
        self.publish_fails.store(fail, AtomicOrdering::SeqCst);
    }

    /// Tell every subscriber of `channel` that its connection was
    /// re-established, as a networked backend does after a drop.
    pub fn resubscribe(&self, channel: &str) {
        if let Some(senders) = self.subscribers.lock().get_mut(channel) {
            senders.retain(|tx| tx.send(Delivery::Resubscribed).is_ok());
        }
    }

    fn check_value_write(&self) -> VigilResult<()> {
        self.check()?;
        if self.value_writes_fail.load(AtomicOrdering::SeqCst) {
            return Err(VigilError::store("memory store rejected the write"));
        }
        Ok(())
    }

    fn check(&self) -> VigilResult<()> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(VigilError::store("memory store is offline"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> VigilResult<Option<String>> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.values.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                state.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> VigilResult<()> {
        self.check_value_write()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state.lock().values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> VigilResult<bool> {
        self.check_value_write()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.values.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> VigilResult<bool> {
        self.check_value_write()?;
        let now = Instant::now();
        let removed = self.state.lock().values.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }

    async fn keys(&self, prefix: &str) -> VigilResult<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .values
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str) -> VigilResult<()> {
        self.check()?;
        self.state
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> VigilResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> VigilResult<Vec<String>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_push(&self, queue: &str, member: &str, priority: u8) -> VigilResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push(QueueEntry {
                priority,
                seq,
                member: member.to_string(),
            });
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> VigilResult<Option<String>> {
        self.check()?;
        let mut state = self.state.lock();
        Ok(state
            .queues
            .get_mut(queue)
            .and_then(BinaryHeap::pop)
            .map(|e| e.member))
    }

    async fn queue_len(&self, queue: &str) -> VigilResult<usize> {
        self.check()?;
        Ok(self.state.lock().queues.get(queue).map_or(0, BinaryHeap::len))
    }

    async fn publish(&self, channel: &str, payload: &str) -> VigilResult<()> {
        self.check()?;
        if self.publish_fails.load(AtomicOrdering::SeqCst) {
            return Err(VigilError::store("memory store rejected the publish"));
        }
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|tx| tx.send(Delivery::Payload(payload.to_string())).is_ok());
            debug!(channel, receivers = senders.len(), "Published");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> VigilResult<Subscription> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx))
    }

    async fn ping(&self) -> bool {
        self.check().is_ok()
    }
}
