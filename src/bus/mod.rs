//! Event bus over a shared pub/sub backend
//!
//! - [`transport`]: encode/publish, subscribe/decode, reconnect with backoff
//! - [`event_bus`]: per-process subscription registry and fan-out

pub mod event_bus;
pub mod transport;

pub use event_bus::{EventBus, Subscription, SubscriptionEnd};
pub use transport::{HEALTH_CHANNEL, PubSubTransport, TransportSubscription};
