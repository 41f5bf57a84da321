//! Typed error handling for the real-time core
//!
//! Every failure the core can surface to a caller is a [`RealtimeError`].
//! The variants follow the error taxonomy shared by the HTTP layer and the
//! duplex sessions: each one knows its HTTP status, a stable machine code
//! and, for sessions, the close code used when the socket is torn down.
//!
//! # Example
//!
//! ```rust,ignore
//! use trip_realtime::prelude::*;
//!
//! match authorizer.check_role(&trip_id, &user_id, MemberRole::Member).await {
//!     Ok(role) => tracing::debug!(?role, "member admitted"),
//!     Err(RealtimeError::NotMember { .. }) => return Err(RealtimeError::forbidden("not a member")),
//!     Err(e) => return Err(e),
//! }
//! ```

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Close code sent when a session violates the slow-consumer policy.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code sent when the server is going away (shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent on unexpected server-side failures.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Application close code for failed authentication.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Application close code for failed authorization.
pub const CLOSE_FORBIDDEN: u16 = 4003;

/// The main error type of the real-time core
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The caller sent syntactically or semantically invalid data
    #[error("Validation failed on '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Missing or invalid bearer token
    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// Authenticated but lacking the required role
    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    /// The user has no membership record for the trip
    #[error("User {user_id} is not a member of trip {trip_id}")]
    NotMember { trip_id: String, user_id: String },

    /// Entity lookup failed
    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    /// Rate limit exceeded; `reset_at` is a unix timestamp in seconds
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited { reset_at: i64, retry_after: u64 },

    /// Pub/sub or key-value backend failure
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Underlying store failure (retryable by the caller)
    #[error("Database error: {0}")]
    Database(String),

    /// Slow-consumer policy triggered
    #[error("Backpressure exceeded")]
    BackpressureExceeded,

    /// The service is draining and refuses new work
    #[error("Service is shutting down")]
    ShuttingDown,

    /// Internal failures that should not happen in normal operation
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response structure for HTTP responses
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RealtimeError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RealtimeError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        RealtimeError::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        RealtimeError::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        RealtimeError::TransportUnavailable(err.to_string())
    }

    pub fn database(err: impl std::fmt::Display) -> Self {
        RealtimeError::Database(err.to_string())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RealtimeError::Validation { .. } => StatusCode::BAD_REQUEST,
            RealtimeError::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
            RealtimeError::Forbidden { .. } | RealtimeError::NotMember { .. } => {
                StatusCode::FORBIDDEN
            }
            RealtimeError::NotFound { .. } => StatusCode::NOT_FOUND,
            RealtimeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RealtimeError::TransportUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RealtimeError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RealtimeError::BackpressureExceeded => StatusCode::SERVICE_UNAVAILABLE,
            RealtimeError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            RealtimeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            RealtimeError::Validation { .. } => "VALIDATION_FAILED",
            RealtimeError::AuthFailed { .. } => "AUTH_FAILED",
            RealtimeError::Forbidden { .. } => "FORBIDDEN",
            RealtimeError::NotMember { .. } => "NOT_MEMBER",
            RealtimeError::NotFound { .. } => "NOT_FOUND",
            RealtimeError::RateLimited { .. } => "RATE_LIMITED",
            RealtimeError::TransportUnavailable(_) => "TRANSPORT_UNAVAILABLE",
            RealtimeError::Database(_) => "DATABASE_ERROR",
            RealtimeError::BackpressureExceeded => "BACKPRESSURE_EXCEEDED",
            RealtimeError::ShuttingDown => "SHUTTING_DOWN",
            RealtimeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Close code used when this error terminates a duplex session
    pub fn close_code(&self) -> u16 {
        match self {
            RealtimeError::AuthFailed { .. } => CLOSE_UNAUTHORIZED,
            RealtimeError::Forbidden { .. } | RealtimeError::NotMember { .. } => CLOSE_FORBIDDEN,
            RealtimeError::BackpressureExceeded | RealtimeError::RateLimited { .. } => {
                CLOSE_POLICY_VIOLATION
            }
            RealtimeError::ShuttingDown => CLOSE_GOING_AWAY,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }

    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Database(_)
                | RealtimeError::TransportUnavailable(_)
                | RealtimeError::RateLimited { .. }
        )
    }

    /// Convert to an error response
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.error_code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            RealtimeError::Validation { field, reason } => Some(serde_json::json!({
                "field": field,
                "reason": reason,
            })),
            RealtimeError::NotFound { entity, id } => Some(serde_json::json!({
                "entity": entity,
                "id": id,
            })),
            RealtimeError::RateLimited {
                reset_at,
                retry_after,
            } => Some(serde_json::json!({
                "reset_at": reset_at,
                "retry_after": retry_after,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for RealtimeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            RealtimeError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        };

        let mut response = (status, Json(self.to_response())).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
