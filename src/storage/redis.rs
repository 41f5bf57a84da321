//! Redis-backed key-value store and pub/sub
//!
//! Multi-step writes (`incr_window`, `compare_and_delete`) run as Lua
//! scripts so they stay atomic across processes.

use crate::core::service::{KeyValueStore, PayloadStream, PubSubBackend};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::Script;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;

const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const SCAN_BATCH: usize = 100;

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

/// Key-value store on a multiplexed Redis connection
#[derive(Clone)]
pub struct RedisKeyValue {
    conn: MultiplexedConnection,
    incr_window: Arc<Script>,
    compare_and_delete: Arc<Script>,
}

impl RedisKeyValue {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            incr_window: Arc::new(Script::new(INCR_WINDOW_SCRIPT)),
            compare_and_delete: Arc::new(Script::new(COMPARE_AND_DELETE_SCRIPT)),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValue {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<(u64, Duration)> {
        let mut conn = self.conn.clone();
        let (count, ttl_ms): (i64, i64) = self
            .incr_window
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;
        Ok((
            count.max(0) as u64,
            Duration::from_millis(ttl_ms.max(0) as u64),
        ))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

/// Pub/sub over Redis channels
///
/// Publishes share one multiplexed connection; every subscription opens
/// its own pub/sub connection, so a dropped connection ends only that
/// subscription's stream.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl PubSubBackend for RedisPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open pub/sub connection")?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(anyhow::Error::from))
            .boxed();
        Ok(stream)
    }
}
