//! Core types shared by every component: events, errors, roles, auth,
//! backend traits, clock and metrics

pub mod auth;
pub mod clock;
pub mod error;
pub mod events;
pub mod membership;
pub mod metrics;
pub mod service;

pub use auth::{StaticTokenValidator, TokenValidator, extract_bearer_token};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorResponse, RealtimeError};
pub use events::{Channel, CodecError, Event, EventType};
pub use membership::{MemberRole, TripAuthorizer};
pub use metrics::{MetricsSnapshot, RealtimeMetrics};
pub use service::{KeyValueStore, LocationStore, MembershipStore, PayloadStream, PubSubBackend};
