//! Server module: the realtime host, its builder and exposures
//!
//! `RealtimeBuilder` assembles a `RealtimeHost` from backends and exposes
//! it through the WebSocket routes:
//! - `GET /trips/{trip_id}/ws` trip chat and typing
//! - `GET /ws/notifications` the caller's notifications

pub mod builder;
pub mod exposure;
pub mod host;

pub use builder::{RealtimeBuilder, shutdown_signal};
pub use exposure::WebSocketExposure;
pub use exposure::websocket::{ConnectionManager, ShutdownReport};
pub use host::{HealthReport, HostComponents, RealtimeHost};
