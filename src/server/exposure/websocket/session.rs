//! One WebSocket session
//!
//! A session runs three cooperating tasks around a bounded outbound queue:
//!
//! ```text
//!                ┌──────────── read pump ◀──── client frames (typing, pong, close)
//!                │                 │
//!                │                 └──▶ EventBus::publish (typing)
//!                │
//! Subscription ──▶ dispatch pump ──▶ typing coalescer ──▶ outbound queue ──▶ write pump ──▶ client
//!                                                                             (ping, retry)
//! ```
//!
//! Lifecycle is `Connecting → Open → Draining → Closed`; states only move
//! forward. Any pump may start draining; the write pump owns the socket
//! and sends the close frame.

use super::protocol::{ClientFrame, ServerFrame, SocketKind};
use super::throttle::{RetryBucket, TypingCoalescer};
use crate::bus::{EventBus, Subscription, SubscriptionEnd};
use crate::config::{BackoffConfig, SessionConfig};
use crate::core::error::{
    CLOSE_FORBIDDEN, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION,
    RealtimeError,
};
use crate::core::events::{Event, EventType, MemberPayload, TypingStatusPayload};
use crate::core::membership::MemberRole;
use crate::core::metrics::RealtimeMetrics;
use crate::server::host::RealtimeHost;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

const SOURCE: &str = "websocket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

/// Control block shared by the pumps of one session and the manager
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub user_id: String,
    pub trip_id: Option<String>,
    state: AtomicU8,
    close: OnceLock<(u16, String)>,
    /// Stop accepting work, flush the outbound queue, then close
    drain: CancellationToken,
    /// Stop immediately
    cancel: CancellationToken,
    /// Fired once the session is fully torn down
    done: CancellationToken,
    started: Instant,
    last_pong_ms: AtomicU64,
}

impl SessionHandle {
    pub(crate) fn new(id: String, user_id: String, trip_id: Option<String>) -> Self {
        Self {
            id,
            user_id,
            trip_id,
            state: AtomicU8::new(SessionState::Connecting as u8),
            close: OnceLock::new(),
            drain: CancellationToken::new(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            started: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to` if that is a later state; returns whether it moved
    fn advance(&self, to: SessionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < to as u8).then_some(to as u8)
            })
            .is_ok()
    }

    /// Close gracefully: queued frames are still written
    pub fn begin_drain(&self, code: u16, reason: &str) {
        let _ = self.close.set((code, reason.to_string()));
        if self.advance(SessionState::Draining) {
            tracing::debug!(session_id = %self.id, code, reason, "session draining");
        }
        self.drain.cancel();
    }

    /// Close now, dropping whatever is still queued
    pub fn abort(&self, code: u16, reason: &str) {
        self.begin_drain(code, reason);
        self.cancel.cancel();
    }

    /// Close code and reason sent to the client
    pub fn close_frame(&self) -> (u16, String) {
        self.close
            .get()
            .cloned()
            .unwrap_or((CLOSE_NORMAL, String::new()))
    }

    /// Resolves once the session is closed and unregistered
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub(crate) fn mark_closed(&self) {
        self.advance(SessionState::Closed);
        self.done.cancel();
    }

    fn touch_pong(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_pong_ms.store(elapsed, Ordering::Relaxed);
    }

    fn since_last_pong(&self) -> Duration {
        let last = Duration::from_millis(self.last_pong_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

// ============================================================================
// Session entry point
// ============================================================================

/// Drive an upgraded socket until it closes
///
/// Authentication and the per-user connection budget are checked before
/// the upgrade; the trip role is checked here, before any frame is sent.
pub(crate) async fn run(
    mut socket: WebSocket,
    host: Arc<RealtimeHost>,
    user_id: String,
    kind: SocketKind,
) {
    let handle = match host
        .connections
        .register(&user_id, kind.trip_id().map(str::to_string))
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            close_socket(&mut socket, e.close_code(), e.error_code()).await;
            return;
        }
    };

    let role = match authorize(&host, &user_id, &kind).await {
        Ok(role) => role,
        Err(e) => {
            tracing::info!(
                session_id = %handle.id,
                user_id = %user_id,
                error = %e,
                "session rejected"
            );
            handle.abort(e.close_code(), e.error_code());
            close_socket(&mut socket, e.close_code(), e.error_code()).await;
            finish(&host, &handle).await;
            return;
        }
    };

    handle.advance(SessionState::Open);

    let subscription = match host
        .event_bus
        .subscribe(
            handle.cancel.clone(),
            kind.channel(&user_id),
            &user_id,
            kind.filters(),
        )
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!(session_id = %handle.id, error = %e, "session subscribe failed");
            handle.abort(e.close_code(), e.error_code());
            close_socket(&mut socket, e.close_code(), e.error_code()).await;
            finish(&host, &handle).await;
            return;
        }
    };

    let config = host.config.session.clone();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.send_buffer_size.max(1));

    let welcome = ServerFrame::Welcome {
        session_id: handle.id.clone(),
        trip_id: kind.trip_id().map(str::to_string),
        role,
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = outbound_tx.try_send(json);
    }

    tracing::info!(
        session_id = %handle.id,
        user_id = %user_id,
        channel = %kind.channel(&user_id),
        "session open"
    );

    let (sink, stream) = socket.split();

    let writer = Writer {
        sink,
        retry: RetryBucket::new(config.retry_tokens, config.retry_refill, Instant::now()),
        retry_backoff: config.retry_backoff.clone(),
        write_timeout: config.write_timeout,
        handle: handle.clone(),
        metrics: host.metrics.clone(),
    };

    let read = tokio::spawn(read_pump(
        stream,
        handle.clone(),
        kind,
        host.event_bus.clone(),
        host.metrics.clone(),
        outbound_tx.clone(),
    ));
    let dispatch = tokio::spawn(dispatch_pump(
        subscription,
        outbound_tx,
        handle.clone(),
        host.metrics.clone(),
        config.typing_interval,
    ));
    let write = tokio::spawn(write_pump(writer, outbound_rx, config));

    let _ = tokio::join!(read, dispatch, write);
    finish(&host, &handle).await;
}

async fn authorize(
    host: &RealtimeHost,
    user_id: &str,
    kind: &SocketKind,
) -> Result<Option<MemberRole>, RealtimeError> {
    match kind {
        SocketKind::TripChat { trip_id } => host
            .authorizer
            .check_role(trip_id, user_id, MemberRole::Member)
            .await
            .map(Some),
        SocketKind::Notifications => Ok(None),
    }
}

async fn finish(host: &RealtimeHost, handle: &Arc<SessionHandle>) {
    handle.cancel.cancel();
    host.connections.unregister(&handle.id).await;
    handle.mark_closed();

    let (code, reason) = handle.close_frame();
    tracing::info!(session_id = %handle.id, user_id = %handle.user_id, code, reason = %reason, "session closed");
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

// ============================================================================
// Read pump
// ============================================================================

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    handle: Arc<SessionHandle>,
    kind: SocketKind,
    bus: EventBus,
    metrics: Arc<RealtimeMetrics>,
    outbound: mpsc::Sender<String>,
) {
    loop {
        let message = tokio::select! {
            _ = handle.cancel.cancelled() => return,
            _ = handle.drain.cancelled() => return,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                metrics.websocket_messages_received.inc();
                if kind.accepts_client_frames() {
                    handle_client_frame(text.as_str(), &handle, &kind, &bus, &outbound).await;
                }
            }
            Some(Ok(Message::Pong(_))) => handle.touch_pong(),
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(session_id = %handle.id, "client closed the socket");
                handle.begin_drain(CLOSE_NORMAL, "client closed");
                return;
            }
            Some(Ok(_)) => {
                // Pings are answered by the socket; binary frames are ignored
            }
            Some(Err(e)) => {
                metrics.websocket_errors.inc();
                tracing::debug!(session_id = %handle.id, error = %e, "websocket read error");
                handle.abort(CLOSE_INTERNAL_ERROR, "read error");
                return;
            }
        }
    }
}

async fn handle_client_frame(
    text: &str,
    handle: &SessionHandle,
    kind: &SocketKind,
    bus: &EventBus,
    outbound: &mpsc::Sender<String>,
) {
    let Some(trip_id) = kind.trip_id() else {
        return;
    };

    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let reply = ServerFrame::Error {
                code: "INVALID_FRAME".to_string(),
                message: format!("Invalid message: {}", e),
            };
            if let Ok(json) = serde_json::to_string(&reply) {
                let _ = outbound.try_send(json);
            }
            return;
        }
    };

    match frame {
        ClientFrame::TypingStatus { is_typing } => {
            let event = match Event::new(
                EventType::ChatTypingStatus,
                trip_id,
                handle.user_id.clone(),
                TypingStatusPayload { is_typing },
            ) {
                Ok(event) => event.with_source(SOURCE),
                Err(e) => {
                    tracing::error!(session_id = %handle.id, error = %e, "failed to build typing event");
                    return;
                }
            };
            if let Err(e) = bus.publish(event).await {
                tracing::debug!(session_id = %handle.id, error = %e, "typing status not published");
            }
        }
    }
}

// ============================================================================
// Dispatch pump
// ============================================================================

async fn dispatch_pump(
    mut subscription: Subscription,
    outbound: mpsc::Sender<String>,
    handle: Arc<SessionHandle>,
    metrics: Arc<RealtimeMetrics>,
    typing_interval: Duration,
) {
    let mut typing = TypingCoalescer::new(typing_interval);

    loop {
        let deadline = typing.next_deadline();

        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => return,
            _ = handle.drain.cancelled() => return,
            _ = wait_until(deadline) => {
                if let Some(event) = typing.flush(Instant::now())
                    && !deliver(&outbound, &handle, &metrics, event)
                {
                    return;
                }
            }
            event = subscription.recv() => {
                let Some(event) = event else {
                    end_session(&handle, subscription.end_reason());
                    return;
                };

                if event.event_type == EventType::ChatTypingStatus {
                    if event.user_id == handle.user_id {
                        continue;
                    }
                    if let Some(event) = typing.offer(event, Instant::now())
                        && !deliver(&outbound, &handle, &metrics, event)
                    {
                        return;
                    }
                    continue;
                }

                let revoked = revokes_session(&event, &handle.user_id);
                if !deliver(&outbound, &handle, &metrics, event) {
                    return;
                }
                if revoked {
                    handle.begin_drain(CLOSE_FORBIDDEN, "membership revoked");
                    return;
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Queue an encoded event; `false` when the session must stop
fn deliver(
    outbound: &mpsc::Sender<String>,
    handle: &SessionHandle,
    metrics: &RealtimeMetrics,
    event: Event,
) -> bool {
    let json = match event.encode() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(session_id = %handle.id, event_id = %event.id, error = %e, "failed to encode event");
            return true;
        }
    };

    match outbound.try_send(json) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) if event.event_type.is_ephemeral() => {
            metrics.events_dropped.inc();
            tracing::debug!(session_id = %handle.id, "outbound queue full, dropping typing event");
            true
        }
        Err(TrySendError::Full(_)) => {
            metrics.backpressure_disconnects.inc();
            tracing::warn!(
                session_id = %handle.id,
                user_id = %handle.user_id,
                event_id = %event.id,
                "outbound queue full, closing slow client"
            );
            handle.abort(CLOSE_POLICY_VIOLATION, "backpressure exceeded");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Whether the event removes this session's user from the trip
fn revokes_session(event: &Event, user_id: &str) -> bool {
    match event.event_type {
        EventType::ChatMemberRemoved => event
            .payload_as::<MemberPayload>()
            .is_ok_and(|p| p.member_id == user_id),
        EventType::MemberLeft => {
            event.user_id == user_id
                || event
                    .payload_as::<MemberPayload>()
                    .is_ok_and(|p| p.member_id == user_id)
        }
        _ => false,
    }
}

fn end_session(handle: &SessionHandle, reason: Option<SubscriptionEnd>) {
    match reason {
        Some(SubscriptionEnd::Backpressure) => {
            handle.abort(CLOSE_POLICY_VIOLATION, "backpressure exceeded")
        }
        Some(SubscriptionEnd::TransportLost) => {
            handle.begin_drain(CLOSE_INTERNAL_ERROR, "event stream lost")
        }
        Some(SubscriptionEnd::Shutdown) => {
            handle.begin_drain(CLOSE_GOING_AWAY, "server shutting down")
        }
        Some(SubscriptionEnd::Replaced) => handle.begin_drain(CLOSE_NORMAL, "session replaced"),
        _ => handle.begin_drain(CLOSE_NORMAL, ""),
    }
}

// ============================================================================
// Write pump
// ============================================================================

struct Writer<S> {
    sink: S,
    retry: RetryBucket,
    retry_backoff: BackoffConfig,
    write_timeout: Duration,
    handle: Arc<SessionHandle>,
    metrics: Arc<RealtimeMetrics>,
}

impl<S> Writer<S>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    /// Write one frame, retrying while the retry bucket has tokens
    ///
    /// The frame is handed to the sink at most once. After the sink took
    /// it, a retry only flushes again, so a flush that timed out cannot
    /// put a second copy on the wire.
    async fn send(&mut self, message: Message) -> Result<(), RealtimeError> {
        let mut pending = Some(message);
        let mut backoff: Option<ExponentialBackoff> = None;

        loop {
            let attempt = match pending.clone() {
                Some(message) => match timeout(self.write_timeout, self.sink.feed(message)).await {
                    Ok(Ok(())) => {
                        pending = None;
                        self.flush().await
                    }
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("write timed out".to_string()),
                },
                None => self.flush().await,
            };
            let error = match attempt {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            self.metrics.websocket_errors.inc();

            if !self.retry.try_take(Instant::now()) {
                return Err(RealtimeError::transport(format!("write failed: {}", error)));
            }

            let delay = backoff
                .get_or_insert_with(|| self.retry_backoff.build())
                .next_backoff()
                .unwrap_or(self.retry_backoff.max_interval);
            tracing::debug!(session_id = %self.handle.id, error = %error, ?delay, "retrying websocket write");

            tokio::select! {
                _ = self.handle.cancel.cancelled() => return Err(RealtimeError::ShuttingDown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn flush(&mut self) -> Result<(), String> {
        match timeout(self.write_timeout, self.sink.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("write timed out".to_string()),
        }
    }

    async fn send_text(&mut self, json: String) -> Result<(), RealtimeError> {
        self.send(Message::Text(json.into())).await
    }

    /// Best-effort close frame
    async fn close(&mut self) {
        let (code, reason) = self.handle.close_frame();
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = timeout(
            self.write_timeout,
            self.sink.send(Message::Close(Some(frame))),
        )
        .await;
    }
}

async fn write_pump<S>(
    mut writer: Writer<S>,
    mut outbound: mpsc::Receiver<String>,
    config: SessionConfig,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let handle = writer.handle.clone();
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break,
            _ = handle.drain.cancelled() => {
                while let Ok(json) = outbound.try_recv() {
                    if writer.send_text(json).await.is_err() {
                        break;
                    }
                }
                break;
            }
            json = outbound.recv() => {
                let Some(json) = json else { break };
                if let Err(e) = writer.send_text(json).await {
                    tracing::debug!(session_id = %handle.id, error = %e, "websocket write failed");
                    handle.abort(CLOSE_INTERNAL_ERROR, "write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if handle.since_last_pong() > config.pong_timeout {
                    tracing::info!(session_id = %handle.id, "heartbeat timed out");
                    handle.abort(CLOSE_GOING_AWAY, "heartbeat timeout");
                    break;
                }
                if writer.send(Message::Ping(Bytes::new())).await.is_err() {
                    handle.abort(CLOSE_INTERNAL_ERROR, "ping failed");
                    break;
                }
            }
        }
    }

    writer.close().await;
    handle.cancel.cancel();
}
