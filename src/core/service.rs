//! Backend traits for the external collaborators of the core
//!
//! The core never talks to Redis, a database or an identity provider
//! directly. It goes through these narrow traits; `storage` provides the
//! in-memory and Redis implementations.

use crate::core::membership::MemberRole;
use crate::location::LatestLocation;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Raw message stream of one pub/sub subscription
///
/// The stream ending, or yielding an error, means the backend connection
/// was lost; the transport adapter reconnects.
pub type PayloadStream = BoxStream<'static, Result<String>>;

/// Shared key-value service (cross-process state)
///
/// All writes are single commands or atomic scripts.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value with a TTL, overwriting any existing one
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set a value with a TTL only if the key is absent
    ///
    /// Returns `true` if the value was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Enumerate keys matching a glob pattern
    ///
    /// `*` and `?` are wildcards and `\` escapes the next character; wrap
    /// untrusted parts of a pattern with [`escape_glob`].
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Atomically increment a window counter
    ///
    /// The TTL is set to `window` only when the increment created the key;
    /// later increments leave it alone. Returns the new count and the
    /// remaining TTL, in a single round trip.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<(u64, Duration)>;

    /// Atomically delete `key` only if it currently holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}

/// Escape glob metacharacters so `literal` only matches itself
pub fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Shared pub/sub service
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Publish a payload on a channel
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Open a subscription on a channel
    ///
    /// Must only return once the backend acknowledged the subscription, so
    /// messages published afterwards are observed.
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream>;
}

/// Latest-location-per-member store
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Replace the latest location of `(trip_id, user_id)`
    async fn upsert_latest(&self, location: LatestLocation) -> Result<LatestLocation>;

    /// All latest locations recorded for a trip
    async fn list_trip_locations(&self, trip_id: &str) -> Result<Vec<LatestLocation>>;
}

/// Trip membership lookups
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Role of the user in the trip, `None` if not a member
    async fn get_role(&self, trip_id: &str, user_id: &str) -> Result<Option<MemberRole>>;
}
