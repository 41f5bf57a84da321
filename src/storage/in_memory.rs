//! In-memory backends for testing and development
//!
//! Every backend can be switched off with `set_available(false)` so tests
//! can exercise the degraded paths (fail-open rate limiting, swallowed
//! publish failures, transport reconnects) without a real outage.

use crate::core::membership::MemberRole;
use crate::core::service::{
    KeyValueStore, LocationStore, MembershipStore, PayloadStream, PubSubBackend,
};
use crate::location::LatestLocation;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

/// Availability switch shared by the in-memory backends
#[derive(Debug, Clone)]
struct Availability(Arc<AtomicBool>);

impl Availability {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn set(&self, available: bool) {
        self.0.store(available, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("{} unavailable", what))
        }
    }
}

// =============================================================================
// Key-value store
// =============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory key-value store with TTLs
///
/// Expiry follows `tokio::time`, so paused-clock tests can advance past a
/// TTL without sleeping.
#[derive(Debug, Clone)]
pub struct InMemoryKeyValue {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    available: Availability,
}

impl InMemoryKeyValue {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            available: Availability::new(),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// Remaining TTL of a key, `None` if absent or persistent
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.available.check("key-value store")?;
        let mut entries = self
            .entries
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(entries)
    }
}

impl Default for InMemoryKeyValue {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate a glob (`*`, `?`, `\` escapes) into an anchored regex
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut body = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => body.push_str(".*"),
            '?' => body.push('.'),
            '\\' => {
                let literal = chars
                    .next()
                    .ok_or_else(|| anyhow!("invalid key pattern: trailing escape"))?;
                body.push_str(&regex::escape(literal.encode_utf8(&mut [0; 4])));
            }
            other => body.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    body.push('$');
    Regex::new(&body).map_err(|e| anyhow!("invalid key pattern: {}", e))
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValue {
    async fn ping(&self) -> Result<()> {
        self.available.check("key-value store")
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.write()?;
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.write()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.write()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.write()?;
        Ok(entries.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let entries = self.write()?;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<(u64, Duration)> {
        let mut entries = self.write()?;
        let now = Instant::now();

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let count = entry
            .value
            .parse::<u64>()
            .map_err(|e| anyhow!("value at '{}' is not a counter: {}", key, e))?
            + 1;
        entry.value = count.to_string();
        if count == 1 {
            entry.expires_at = Some(now + window);
        }

        let ttl = entry
            .expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(window);
        Ok((count, ttl))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.write()?;
        match entries.get(key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// =============================================================================
// Pub/sub
// =============================================================================

const CHANNEL_CAPACITY: usize = 1024;

/// In-memory pub/sub backend
///
/// One broadcast channel per pub/sub channel. `drop_connections` ends every
/// open subscription stream, which subscribers observe as a disconnect.
#[derive(Clone)]
pub struct InMemoryPubSub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    connection: Arc<RwLock<CancellationToken>>,
    available: Availability,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            connection: Arc::new(RwLock::new(CancellationToken::new())),
            available: Availability::new(),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    ///
    /// Only new publishes and subscribes fail; use
    /// [`drop_connections`](Self::drop_connections) to cut live streams.
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// End every open subscription stream
    pub fn drop_connections(&self) {
        if let Ok(mut connection) = self.connection.write() {
            connection.cancel();
            *connection = CancellationToken::new();
        }
    }

    /// Number of open backend subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .ok()
            .and_then(|channels| channels.get(channel).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubBackend for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.available.check("pub/sub backend")?;
        let channels = self
            .channels
            .read()
            .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))?;
        if let Some(tx) = channels.get(channel) {
            // No receivers is not an error, same as PUBLISH returning 0
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        self.available.check("pub/sub backend")?;

        let rx = {
            let mut channels = self
                .channels
                .write()
                .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let connection = self
            .connection
            .read()
            .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))?
            .clone();

        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx)
            .filter_map(move |item| {
                let out = match item {
                    Ok(payload) => Some(Ok(payload)),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "in-memory subscriber lagged");
                        None
                    }
                };
                futures::future::ready(out)
            })
            .take_until(connection.cancelled_owned());

        Ok(stream.boxed())
    }
}

// =============================================================================
// Latest-location store
// =============================================================================

/// In-memory latest-location store keyed by `(trip_id, user_id)`
#[derive(Debug, Clone)]
pub struct InMemoryLocationStore {
    locations: Arc<RwLock<HashMap<(String, String), LatestLocation>>>,
    available: Availability,
}

impl InMemoryLocationStore {
    pub fn new() -> Self {
        Self {
            locations: Arc::new(RwLock::new(HashMap::new())),
            available: Availability::new(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// Latest location of one member, if any
    pub fn latest(&self, trip_id: &str, user_id: &str) -> Option<LatestLocation> {
        self.locations
            .read()
            .ok()?
            .get(&(trip_id.to_string(), user_id.to_string()))
            .cloned()
    }
}

impl Default for InMemoryLocationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationStore for InMemoryLocationStore {
    async fn upsert_latest(&self, location: LatestLocation) -> Result<LatestLocation> {
        self.available.check("location store")?;
        let mut locations = self
            .locations
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;

        locations.insert(
            (location.trip_id.clone(), location.user_id.clone()),
            location.clone(),
        );

        Ok(location)
    }

    async fn list_trip_locations(&self, trip_id: &str) -> Result<Vec<LatestLocation>> {
        self.available.check("location store")?;
        let locations = self
            .locations
            .read()
            .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))?;

        let mut found: Vec<LatestLocation> = locations
            .values()
            .filter(|l| l.trip_id == trip_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(found)
    }
}

// =============================================================================
// Membership store
// =============================================================================

/// In-memory trip membership table
#[derive(Debug, Clone)]
pub struct InMemoryMembershipStore {
    roles: Arc<RwLock<HashMap<(String, String), MemberRole>>>,
    available: Availability,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self {
            roles: Arc::new(RwLock::new(HashMap::new())),
            available: Availability::new(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    pub fn set_role(&self, trip_id: &str, user_id: &str, role: MemberRole) {
        if let Ok(mut roles) = self.roles.write() {
            roles.insert((trip_id.to_string(), user_id.to_string()), role);
        }
    }

    pub fn remove_member(&self, trip_id: &str, user_id: &str) {
        if let Ok(mut roles) = self.roles.write() {
            roles.remove(&(trip_id.to_string(), user_id.to_string()));
        }
    }
}

impl Default for InMemoryMembershipStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn get_role(&self, trip_id: &str, user_id: &str) -> Result<Option<MemberRole>> {
        self.available.check("membership store")?;
        let roles = self
            .roles
            .read()
            .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))?;

        Ok(roles
            .get(&(trip_id.to_string(), user_id.to_string()))
            .copied())
    }
}
