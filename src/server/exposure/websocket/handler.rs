//! WebSocket upgrade handlers
//!
//! The HTTP side of the handshake runs before the upgrade:
//!
//! 1. Bearer token from `Authorization` or `?token=` (401 when missing/invalid)
//! 2. Per-user connection budget `ws:{userID}` (429 when exhausted)
//! 3. Refuse when the server is draining (503)
//!
//! Trip role checks happen after the upgrade, see [`session::run`].

use super::protocol::SocketKind;
use super::session;
use crate::core::auth::extract_bearer_token;
use crate::core::error::RealtimeError;
use crate::ratelimit::SCOPE_WS;
use crate::server::host::RealtimeHost;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

/// `GET /trips/{trip_id}/ws`
pub async fn trip_socket(
    ws: WebSocketUpgrade,
    Path(trip_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    State(host): State<Arc<RealtimeHost>>,
) -> Response {
    upgrade(ws, SocketKind::TripChat { trip_id }, query, headers, host).await
}

/// `GET /ws/notifications`
pub async fn notification_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    State(host): State<Arc<RealtimeHost>>,
) -> Response {
    upgrade(ws, SocketKind::Notifications, query, headers, host).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    kind: SocketKind,
    query: ConnectQuery,
    headers: HeaderMap,
    host: Arc<RealtimeHost>,
) -> Response {
    let user_id = match authenticate(&host, &headers, query.token.as_deref()).await {
        Ok(user_id) => user_id,
        Err(e) => return e.into_response(),
    };

    let limits = &host.config.rate_limit;
    let decision = host
        .rate_limiter
        .take(SCOPE_WS, &user_id, limits.ws_connections_per_window, limits.window)
        .await;
    if let Err(e) = decision.check() {
        tracing::warn!(user_id = %user_id, "WebSocket connection rate limited");
        return e.into_response();
    }

    if !host.connections.is_accepting() {
        return RealtimeError::ShuttingDown.into_response();
    }

    ws.on_upgrade(move |socket| session::run(socket, host, user_id, kind))
}

async fn authenticate(
    host: &RealtimeHost,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<String, RealtimeError> {
    let token = extract_bearer_token(headers, query_token)
        .ok_or_else(|| RealtimeError::auth_failed("missing bearer token"))?;
    host.token_validator.validate(&token).await
}
