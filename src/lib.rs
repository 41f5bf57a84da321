//! # trip-realtime
//!
//! Real-time coordination core for collaborative trips.
//!
//! ## Features
//!
//! - **Event bus**: typed trip and user events fanned out to local
//!   subscribers over a shared pub/sub backend, with reconnect and
//!   per-subscriber backpressure
//! - **Duplex sessions**: authenticated WebSocket endpoints for trip chat
//!   and notifications, with heartbeats, typing coalescing and graceful
//!   draining
//! - **Offline replay**: location batches recorded while a device was
//!   offline are replayed in timestamp order under a per-user lease
//! - **Rate limiting**: fixed-window counters in the shared key-value
//!   store that fail open when the store is unreachable
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trip_realtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let validator = StaticTokenValidator::new().with_token("t0k3n", "user-1");
//!
//!     RealtimeBuilder::new()
//!         .with_config(RealtimeConfig::from_env())
//!         .with_token_validator(validator)
//!         .serve("0.0.0.0:8080")
//!         .await
//! }
//! ```

pub mod bus;
pub mod config;
pub mod core;
pub mod location;
pub mod ratelimit;
pub mod server;
pub mod storage;

/// Re-exports of commonly used types and traits
pub mod prelude {
    // === Core ===
    pub use crate::core::{
        auth::{StaticTokenValidator, TokenValidator, extract_bearer_token},
        clock::{Clock, ManualClock, SystemClock},
        error::RealtimeError,
        events::{Channel, Event, EventType},
        membership::{MemberRole, TripAuthorizer},
        metrics::{MetricsSnapshot, RealtimeMetrics},
        service::{KeyValueStore, LocationStore, MembershipStore, PubSubBackend},
    };

    // === Bus ===
    pub use crate::bus::{EventBus, Subscription, SubscriptionEnd};

    // === Locations ===
    pub use crate::location::{
        LatestLocation, LocationService, LocationUpdate, MemberLocation, OfflineLocationQueue,
        ReplayReport,
    };

    // === Rate limiting ===
    pub use crate::ratelimit::{RateLimitDecision, RateLimitPolicy, RateLimiter, rate_limit_middleware};

    // === Storage ===
    #[cfg(feature = "in-memory")]
    pub use crate::storage::{
        InMemoryKeyValue, InMemoryLocationStore, InMemoryMembershipStore, InMemoryPubSub,
    };
    #[cfg(feature = "redis")]
    pub use crate::storage::{RedisKeyValue, RedisPubSub};

    // === Config ===
    pub use crate::config::RealtimeConfig;

    // === Server ===
    pub use crate::server::{
        ConnectionManager, RealtimeBuilder, RealtimeHost, ShutdownReport, WebSocketExposure,
    };

    // === External dependencies ===
    pub use anyhow::Result;
    pub use async_trait::async_trait;
    pub use chrono::{DateTime, Utc};
    pub use serde::{Deserialize, Serialize};
    pub use uuid::Uuid;

    // === Axum ===
    pub use axum::{
        Router,
        extract::{Path, State},
        routing::{get, post},
    };
}
