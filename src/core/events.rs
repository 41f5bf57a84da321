//! Trip events and their wire codec
//!
//! An [`Event`] is the immutable record fanned out to every client of a trip.
//! On the wire (pub/sub channels and duplex frames alike) it is a flat JSON
//! object: the envelope fields plus the type-specific payload fields.
//!
//! ```json
//! {
//!   "type": "CHAT_MESSAGE_SENT",
//!   "id": "0d9c7e0e-5d4c-4f55-9d0f-1b1f8e7c2a11",
//!   "tripID": "trip-1",
//!   "userID": "user-1",
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "source": "chat_service",
//!   "messageID": "m-1",
//!   "content": "hi"
//! }
//! ```
//!
//! Payloads stay opaque to the core: sessions relay them untouched and only
//! consumers that care decode them with [`Event::payload_as`].
//!
//! # Architecture
//!
//! ```text
//! LocationService ──┐
//!                   ├──▶ EventBus::publish() ──▶ codec::encode ──▶ channel trip:{id}
//! Typing frames  ───┘                                          ──▶ channel user:{id}
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::error::RealtimeError;

/// Kinds of events carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ChatMessageSent,
    ChatMessageEdited,
    ChatMessageDeleted,
    ChatReactionAdded,
    ChatReactionRemoved,
    ChatReadReceiptUpdated,
    ChatMemberAdded,
    ChatMemberRemoved,
    ChatTypingStatus,
    LocationUpdated,
    TripUpdated,
    MemberJoined,
    MemberLeft,
    NotificationCreated,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        EventType::ChatMessageSent,
        EventType::ChatMessageEdited,
        EventType::ChatMessageDeleted,
        EventType::ChatReactionAdded,
        EventType::ChatReactionRemoved,
        EventType::ChatReadReceiptUpdated,
        EventType::ChatMemberAdded,
        EventType::ChatMemberRemoved,
        EventType::ChatTypingStatus,
        EventType::LocationUpdated,
        EventType::TripUpdated,
        EventType::MemberJoined,
        EventType::MemberLeft,
        EventType::NotificationCreated,
    ];

    /// Event types delivered on a trip-chat socket
    pub const CHAT: [EventType; 9] = [
        EventType::ChatMessageSent,
        EventType::ChatMessageEdited,
        EventType::ChatMessageDeleted,
        EventType::ChatReactionAdded,
        EventType::ChatReactionRemoved,
        EventType::ChatReadReceiptUpdated,
        EventType::ChatMemberAdded,
        EventType::ChatMemberRemoved,
        EventType::ChatTypingStatus,
    ];

    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ChatMessageSent => "CHAT_MESSAGE_SENT",
            EventType::ChatMessageEdited => "CHAT_MESSAGE_EDITED",
            EventType::ChatMessageDeleted => "CHAT_MESSAGE_DELETED",
            EventType::ChatReactionAdded => "CHAT_REACTION_ADDED",
            EventType::ChatReactionRemoved => "CHAT_REACTION_REMOVED",
            EventType::ChatReadReceiptUpdated => "CHAT_READ_RECEIPT_UPDATED",
            EventType::ChatMemberAdded => "CHAT_MEMBER_ADDED",
            EventType::ChatMemberRemoved => "CHAT_MEMBER_REMOVED",
            EventType::ChatTypingStatus => "CHAT_TYPING_STATUS",
            EventType::LocationUpdated => "LOCATION_UPDATED",
            EventType::TripUpdated => "TRIP_UPDATED",
            EventType::MemberJoined => "MEMBER_JOINED",
            EventType::MemberLeft => "MEMBER_LEFT",
            EventType::NotificationCreated => "NOTIFICATION_CREATED",
        }
    }

    /// Events routed on the user channel instead of the trip channel
    pub fn is_user_scoped(&self) -> bool {
        matches!(self, EventType::NotificationCreated)
    }

    /// Presence-like events that may be dropped or coalesced under load
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, EventType::ChatTypingStatus)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CodecError::UnknownType(s.to_string()))
    }
}

/// A routing key in the pub/sub transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// `trip:{tripID}`
    Trip(String),
    /// `user:{userID}`
    User(String),
}

impl Channel {
    pub fn trip(trip_id: impl Into<String>) -> Self {
        Channel::Trip(trip_id.into())
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Channel::User(user_id.into())
    }

    /// Trip ID of a trip channel, empty for user channels
    pub fn trip_id(&self) -> &str {
        match self {
            Channel::Trip(id) => id,
            Channel::User(_) => "",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Trip(id) => write!(f, "trip:{}", id),
            Channel::User(id) => write!(f, "user:{}", id),
        }
    }
}

/// Errors raised while decoding bus messages
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The message is not a well-formed event object
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The `type` field names an event type this build does not know
    #[error("unknown event type '{0}'")]
    UnknownType(String),
}

/// A trip event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEvent", try_from = "WireEvent")]
pub struct Event {
    /// Unique event ID, generated at publish time
    pub id: Uuid,
    pub event_type: EventType,
    /// Routing key, empty only for user-scoped events
    pub trip_id: String,
    /// Originator (or recipient for user-scoped events)
    pub user_id: String,
    /// Advisory wall-clock time at publish
    pub timestamp: DateTime<Utc>,
    /// Publishing service, for diagnostics
    pub source: String,
    pub correlation_id: Option<String>,
    /// Type-specific fields, flattened into the wire object
    pub payload: Map<String, Value>,
}

/// Flat wire representation of an [`Event`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    id: Uuid,
    #[serde(rename = "tripID", default)]
    trip_id: String,
    #[serde(rename = "userID", default)]
    user_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    source: String,
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    correlation_id: Option<String>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        WireEvent {
            kind: event.event_type.as_str().to_string(),
            id: event.id,
            trip_id: event.trip_id,
            user_id: event.user_id,
            timestamp: event.timestamp,
            source: event.source,
            correlation_id: event.correlation_id,
            payload: event.payload,
        }
    }
}

impl TryFrom<WireEvent> for Event {
    type Error = CodecError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        Ok(Event {
            event_type: wire.kind.parse()?,
            id: wire.id,
            trip_id: wire.trip_id,
            user_id: wire.user_id,
            timestamp: wire.timestamp,
            source: wire.source,
            correlation_id: wire.correlation_id,
            payload: wire.payload,
        })
    }
}

/// Envelope keys that a payload must not shadow
const RESERVED_KEYS: [&str; 7] = [
    "type",
    "id",
    "tripID",
    "userID",
    "timestamp",
    "source",
    "correlationID",
];

impl Event {
    /// Create a new event with a fresh ID and the current time
    ///
    /// The payload must serialize to a JSON object; its fields are flattened
    /// next to the envelope fields on the wire.
    pub fn new(
        event_type: EventType,
        trip_id: impl Into<String>,
        user_id: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Self, RealtimeError> {
        let payload = match serde_json::to_value(payload)
            .map_err(|e| RealtimeError::Internal(format!("failed to encode payload: {}", e)))?
        {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(RealtimeError::Internal(format!(
                    "event payload must be an object, got {}",
                    other
                )));
            }
        };

        if let Some(key) = RESERVED_KEYS.iter().find(|k| payload.contains_key(**k)) {
            return Err(RealtimeError::Internal(format!(
                "event payload shadows envelope field '{}'",
                key
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            trip_id: trip_id.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            source: String::new(),
            correlation_id: None,
            payload,
        })
    }

    /// Set the publishing service name
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// The channel this event is published on
    pub fn channel(&self) -> Channel {
        if self.event_type.is_user_scoped() {
            Channel::user(self.user_id.clone())
        } else {
            Channel::trip(self.trip_id.clone())
        }
    }

    /// Decode the payload into a type-specific structure
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    /// Check the envelope invariants before publishing
    pub fn validate(&self) -> Result<(), RealtimeError> {
        if self.id.is_nil() {
            return Err(RealtimeError::validation("id", "event ID is required"));
        }
        if self.user_id.is_empty() {
            return Err(RealtimeError::validation("userID", "user ID is required"));
        }
        if self.trip_id.is_empty() && !self.event_type.is_user_scoped() {
            return Err(RealtimeError::validation(
                "tripID",
                format!("trip ID is required for {}", self.event_type),
            ));
        }
        Ok(())
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<String, RealtimeError> {
        serde_json::to_string(self)
            .map_err(|e| RealtimeError::Internal(format!("failed to encode event: {}", e)))
    }

    /// Decode from the JSON wire form
    ///
    /// Unknown event types are reported separately from malformed input so
    /// the transport can count and drop them.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let wire: WireEvent = serde_json::from_str(raw)?;
        Event::try_from(wire)
    }
}

// =============================================================================
// Payload schemas
// =============================================================================

/// Payload of `CHAT_MESSAGE_SENT` / `CHAT_MESSAGE_EDITED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    #[serde(rename = "messageID")]
    pub message_id: String,
    pub content: String,
    #[serde(rename = "replyToID", default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

/// Payload of `CHAT_MESSAGE_DELETED` and `CHAT_READ_RECEIPT_UPDATED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageRefPayload {
    #[serde(rename = "messageID")]
    pub message_id: String,
}

/// Payload of `CHAT_REACTION_ADDED` / `CHAT_REACTION_REMOVED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReactionPayload {
    #[serde(rename = "messageID")]
    pub message_id: String,
    pub reaction: String,
}

/// Payload of `CHAT_TYPING_STATUS`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatusPayload {
    pub is_typing: bool,
}

/// Payload of `MEMBER_JOINED`, `MEMBER_LEFT`, `CHAT_MEMBER_ADDED`, `CHAT_MEMBER_REMOVED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberPayload {
    #[serde(rename = "memberID")]
    pub member_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Payload of `NOTIFICATION_CREATED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "notificationID")]
    pub notification_id: String,
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_event() -> Event {
        Event::new(
            EventType::ChatMessageSent,
            "trip-1",
            "user-1",
            ChatMessagePayload {
                message_id: "m-1".to_string(),
                content: "hi".to_string(),
                reply_to_id: None,
                attachments: vec![],
            },
        )
        .unwrap()
        .with_source("chat_service")
    }

    #[test]
    fn test_wire_form_is_flat() {
        let event = chat_event();
        let json: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "CHAT_MESSAGE_SENT");
        assert_eq!(json["tripID"], "trip-1");
        assert_eq!(json["userID"], "user-1");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["messageID"], "m-1");
        assert_eq!(json["source"], "chat_service");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_every_type_survives_the_wire() {
        for event_type in EventType::ALL {
            let trip = if event_type.is_user_scoped() { "" } else { "trip-9" };
            let event = Event::new(event_type, trip, "user-9", json!({"k": [1, 2, 3]})).unwrap();
            let decoded = Event::decode(&event.encode().unwrap()).unwrap();
            assert_eq!(decoded, event, "round trip failed for {}", event_type);
        }
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let raw = json!({
            "type": "WEATHER_UPDATED",
            "id": Uuid::new_v4(),
            "tripID": "t",
            "userID": "u",
            "timestamp": "2024-05-01T12:00:00Z"
        })
        .to_string();

        assert!(matches!(
            Event::decode(&raw),
            Err(CodecError::UnknownType(t)) if t == "WEATHER_UPDATED"
        ));
    }

    #[test]
    fn test_malformed_input_is_reported() {
        assert!(matches!(
            Event::decode("{not json"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_payload_cannot_shadow_envelope() {
        let result = Event::new(EventType::TripUpdated, "t", "u", json!({"tripID": "other"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_channel_routing() {
        assert_eq!(chat_event().channel().to_string(), "trip:trip-1");

        let notification = Event::new(
            EventType::NotificationCreated,
            "",
            "user-7",
            NotificationPayload {
                notification_id: "n-1".to_string(),
                kind: "TRIP_INVITE".to_string(),
                message: "You were invited".to_string(),
            },
        )
        .unwrap();
        assert_eq!(notification.channel().to_string(), "user:user-7");
        assert!(notification.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_trip_for_trip_events() {
        let event = Event::new(EventType::LocationUpdated, "", "user-1", json!({})).unwrap();
        assert!(matches!(
            event.validate(),
            Err(RealtimeError::Validation { field, .. }) if field == "tripID"
        ));
    }

    #[test]
    fn test_payload_as_typed_struct() {
        let payload: ChatMessagePayload = chat_event().payload_as().unwrap();
        assert_eq!(payload.content, "hi");
    }

    #[test]
    fn test_ephemeral_classification() {
        assert!(EventType::ChatTypingStatus.is_ephemeral());
        assert!(!EventType::ChatMessageSent.is_ephemeral());
    }
}
