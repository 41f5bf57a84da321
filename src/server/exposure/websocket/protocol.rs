//! WebSocket message protocol
//!
//! Server → client frames are either bus events in their wire form
//! (`{"type": "CHAT_MESSAGE_SENT", "tripID": ..., ...}`) or one of the
//! control frames below. Clients may only send `typing_status` frames, and
//! only on trip chat sockets.

use crate::core::events::{Channel, EventType};
use crate::core::membership::MemberRole;
use serde::{Deserialize, Serialize};

/// What a socket is subscribed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketKind {
    /// `/trips/{trip_id}/ws`: chat and typing events of one trip
    TripChat { trip_id: String },
    /// `/ws/notifications`: the user's own notification channel
    Notifications,
}

impl SocketKind {
    /// Bus channel for this socket
    pub fn channel(&self, user_id: &str) -> Channel {
        match self {
            SocketKind::TripChat { trip_id } => Channel::trip(trip_id.clone()),
            SocketKind::Notifications => Channel::user(user_id),
        }
    }

    /// Event types delivered on this socket
    pub fn filters(&self) -> Vec<EventType> {
        match self {
            SocketKind::TripChat { .. } => {
                let mut filters = EventType::CHAT.to_vec();
                filters.push(EventType::MemberLeft);
                filters
            }
            SocketKind::Notifications => vec![EventType::NotificationCreated],
        }
    }

    pub fn trip_id(&self) -> Option<&str> {
        match self {
            SocketKind::TripChat { trip_id } => Some(trip_id),
            SocketKind::Notifications => None,
        }
    }

    /// Whether inbound frames are interpreted at all
    pub fn accepts_client_frames(&self) -> bool {
        matches!(self, SocketKind::TripChat { .. })
    }
}

/// Frames a client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    TypingStatus {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
}

/// Control frames sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame of every session
    Welcome {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "tripID", skip_serializing_if = "Option::is_none", default)]
        trip_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        role: Option<MemberRole>,
    },
    /// Rejected client frame; the session stays open
    Error { code: String, message: String },
}
