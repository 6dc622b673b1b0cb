use crate::{Delivery, Store, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vigil_core::{VigilError, VigilResult};

/// Equal priorities are ordered by a per-queue sequence folded into the score.
const PRIORITY_SCALE: f64 = (1u64 << 40) as f64;

/// [`Store`] backed by Redis, shared by every process of a deployment.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> VigilResult<Self> {
        info!("Connecting to Redis at {}", redis_url);

        let client = redis::Client::open(redis_url)
            .map_err(|e| VigilError::store(format!("Failed to create Redis client: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| VigilError::store(format!("Failed to connect to Redis: {e}")))?;

        info!("Connected to Redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// 100ms doubling per failed attempt, capped at 5s.
fn resubscribe_delay(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(1u64 << attempt.min(6));
    Duration::from_millis(millis.min(5_000))
}

async fn open_pubsub(client: &redis::Client, channel: &str) -> VigilResult<redis::aio::PubSub> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(store_err("pub/sub connect"))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(store_err("SUBSCRIBE"))?;
    Ok(pubsub)
}

fn store_err(op: &'static str) -> impl FnOnce(redis::RedisError) -> VigilError {
    move |e| VigilError::store(format!("Redis {op} failed: {e}"))
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> VigilResult<Option<String>> {
        self.conn().get(key).await.map_err(store_err("GET"))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> VigilResult<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(store_err("SETEX")),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(store_err("SET")),
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> VigilResult<bool> {
        self.conn()
            .set_nx(key, value)
            .await
            .map_err(store_err("SETNX"))
    }

    async fn delete(&self, key: &str) -> VigilResult<bool> {
        let removed: i64 = self.conn().del(key).await.map_err(store_err("DEL"))?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> VigilResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .conn()
            .keys(format!("{prefix}*"))
            .await
            .map_err(store_err("KEYS"))?;
        keys.sort();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str) -> VigilResult<()> {
        self.conn()
            .sadd::<_, _, ()>(key, member)
            .await
            .map_err(store_err("SADD"))
    }

    async fn set_remove(&self, key: &str, member: &str) -> VigilResult<()> {
        self.conn()
            .srem::<_, _, ()>(key, member)
            .await
            .map_err(store_err("SREM"))
    }

    async fn set_members(&self, key: &str) -> VigilResult<Vec<String>> {
        let mut members: Vec<String> = self
            .conn()
            .smembers(key)
            .await
            .map_err(store_err("SMEMBERS"))?;
        members.sort();
        Ok(members)
    }

    async fn queue_push(&self, queue: &str, member: &str, priority: u8) -> VigilResult<()> {
        let mut conn = self.conn();
        let seq: u64 = conn
            .incr(format!("{queue}:seq"), 1)
            .await
            .map_err(store_err("INCR"))?;
        let score = f64::from(priority) * PRIORITY_SCALE - seq as f64;
        conn.zadd::<_, _, _, ()>(queue, member, score)
            .await
            .map_err(store_err("ZADD"))
    }

    async fn queue_pop(&self, queue: &str) -> VigilResult<Option<String>> {
        let popped: Vec<(String, f64)> = self
            .conn()
            .zpopmax(queue, 1)
            .await
            .map_err(store_err("ZPOPMAX"))?;
        Ok(popped.into_iter().next().map(|(member, _)| member))
    }

    async fn queue_len(&self, queue: &str) -> VigilResult<usize> {
        self.conn().zcard(queue).await.map_err(store_err("ZCARD"))
    }

    async fn publish(&self, channel: &str, payload: &str) -> VigilResult<()> {
        let receivers: i64 = self
            .conn()
            .publish(channel, payload)
            .await
            .map_err(store_err("PUBLISH"))?;
        debug!(channel, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> VigilResult<Subscription> {
        let pubsub = open_pubsub(&self.client, channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(channel = %name, error = %e, "Dropping undecodable payload");
                            continue;
                        }
                    };
                    if tx.send(Delivery::Payload(payload)).is_err() {
                        debug!(channel = %name, "Subscription closed");
                        return;
                    }
                }
                if tx.is_closed() {
                    debug!(channel = %name, "Subscription closed");
                    return;
                }

                warn!(channel = %name, "Pub/sub connection lost; resubscribing");
                let mut attempt: u32 = 0;
                messages = loop {
                    tokio::time::sleep(resubscribe_delay(attempt)).await;
                    if tx.is_closed() {
                        return;
                    }
                    match open_pubsub(&client, &name).await {
                        Ok(pubsub) => break pubsub.into_on_message(),
                        Err(e) => {
                            warn!(channel = %name, attempt, error = %e, "Resubscribe failed");
                            attempt = attempt.saturating_add(1);
                        }
                    }
                };
                info!(channel = %name, "Resubscribed");
                if tx.send(Delivery::Resubscribed).is_err() {
                    return;
                }
            }
        });

        Ok(Subscription::new(channel, rx))
    }

    async fn ping(&self) -> bool {
        redis::cmd("PING")
            .query_async::<String>(&mut self.conn())
            .await
            .is_ok()
    }
}
