//! Backend implementations
//!
//! - `in_memory` (feature `in-memory`, default): single-process stores for
//!   tests, demos and single-node deployments
//! - `redis` (feature `redis`): shared key-value store and pub/sub

#[cfg(feature = "in-memory")]
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "in-memory")]
pub use in_memory::{InMemoryKeyValue, InMemoryLocationStore, InMemoryMembershipStore, InMemoryPubSub};
#[cfg(feature = "redis")]
pub use self::redis::{RedisKeyValue, RedisPubSub};
