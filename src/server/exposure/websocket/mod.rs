//! WebSocket exposure: trip chat and notification sockets
//!
//! # Architecture
//!
//! ```text
//! Client ──ws──▶ /trips/{trip_id}/ws ──┐
//!                                      ├─▶ handler (auth, ws:{user} budget) ──▶ session::run
//! Client ──ws──▶ /ws/notifications ────┘                                             │
//!                                                                   EventBus::subscribe(trip:{id} | user:{id})
//! ```
//!
//! # Protocol
//!
//! Client → Server (JSON, trip chat only):
//! - `{"type": "typing_status", "isTyping": true}`
//!
//! Server → Client (JSON):
//! - `{"type": "welcome", "sessionID": "...", "tripID": "...", "role": "MEMBER"}`
//! - bus events in wire form, e.g. `{"type": "CHAT_MESSAGE_SENT", "tripID": ..., "userID": ..., ...}`
//! - `{"type": "error", "code": "...", "message": "..."}`
//!
//! Close codes: 1000 normal, 1001 shutdown or heartbeat timeout, 1008 slow
//! consumer, 1011 internal error, 4003 not a member or membership revoked.

mod handler;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod throttle;

pub use manager::{ConnectionManager, ShutdownReport};
pub use protocol::{ClientFrame, ServerFrame, SocketKind};
pub use session::{SessionHandle, SessionState};

use crate::server::host::RealtimeHost;
use anyhow::Result;
use axum::{Router, routing::get};
use std::sync::Arc;

/// Builds the WebSocket routes for a host
///
/// # Example
///
/// ```rust,ignore
/// use trip_realtime::server::{RealtimeBuilder, WebSocketExposure};
/// use std::sync::Arc;
///
/// let host = Arc::new(RealtimeBuilder::new().build_host()?);
/// let app = WebSocketExposure::build_router(host)?;
/// ```
pub struct WebSocketExposure;

impl WebSocketExposure {
    pub fn build_router(host: Arc<RealtimeHost>) -> Result<Router> {
        let router = Router::new()
            .route("/trips/{trip_id}/ws", get(handler::trip_socket))
            .route("/ws/notifications", get(handler::notification_socket))
            .with_state(host);

        Ok(router)
    }
}
