//! Registry of live WebSocket sessions
//!
//! The `ConnectionManager` knows every session of this process. It is the
//! entry point for revoking a member's sessions and for draining all
//! sessions on shutdown.
//!
//! # Shutdown
//!
//! ```text
//! shutdown(grace)
//!   ├─ stop accepting new sessions
//!   ├─ every session: begin_drain(1001)  ── write pump flushes its queue, sends close
//!   └─ wait up to `grace` ── still open? abort ── counted as forced
//! ```

use super::session::SessionHandle;
use crate::core::error::{CLOSE_FORBIDDEN, CLOSE_GOING_AWAY, RealtimeError};
use crate::core::metrics::RealtimeMetrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

/// Outcome of [`ConnectionManager::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Sessions that closed on their own within the grace period
    pub drained: usize,
    /// Sessions that had to be aborted
    pub forced: usize,
}

/// Tracks all WebSocket sessions of this process
///
/// Reads (counts, lookups) are frequent; writes happen on connect and
/// disconnect only.
pub struct ConnectionManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    accepting: AtomicBool,
    metrics: Arc<RealtimeMetrics>,
}

impl ConnectionManager {
    pub fn new(metrics: Arc<RealtimeMetrics>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            metrics,
        }
    }

    /// Register a new session
    ///
    /// Fails with `ShuttingDown` once [`shutdown`](Self::shutdown) started.
    pub async fn register(
        &self,
        user_id: &str,
        trip_id: Option<String>,
    ) -> Result<Arc<SessionHandle>, RealtimeError> {
        let mut sessions = self.sessions.write().await;
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RealtimeError::ShuttingDown);
        }

        let session_id = format!("sess_{}", Uuid::new_v4().simple());
        let handle = Arc::new(SessionHandle::new(
            session_id.clone(),
            user_id.to_string(),
            trip_id,
        ));
        sessions.insert(session_id.clone(), handle.clone());
        self.metrics.websocket_active_connections.inc();

        tracing::debug!(session_id = %session_id, user_id, "WebSocket client connected");
        Ok(handle)
    }

    /// Remove a session once it closed
    pub async fn unregister(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            self.metrics.websocket_active_connections.dec();
            tracing::debug!(session_id = %session_id, "WebSocket client disconnected");
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Sessions of one user, across trips
    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Close every session of `user_id` on `trip_id` with 4003
    ///
    /// Returns how many sessions were told to close.
    pub async fn revoke(&self, trip_id: &str, user_id: &str) -> usize {
        let sessions = self.sessions.read().await;
        let mut revoked = 0;
        for session in sessions.values() {
            if session.user_id == user_id && session.trip_id.as_deref() == Some(trip_id) {
                session.begin_drain(CLOSE_FORBIDDEN, "membership revoked");
                revoked += 1;
            }
        }
        if revoked > 0 {
            tracing::info!(trip_id, user_id, sessions = revoked, "trip sessions revoked");
        }
        revoked
    }

    /// Drain all sessions, aborting those still open after `grace`
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let sessions: Vec<Arc<SessionHandle>> = {
            let sessions = self.sessions.write().await;
            self.accepting.store(false, Ordering::Release);
            sessions.values().cloned().collect()
        };

        tracing::info!(sessions = sessions.len(), ?grace, "draining WebSocket sessions");

        for session in &sessions {
            session.begin_drain(CLOSE_GOING_AWAY, "server shutting down");
        }

        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();
        for session in &sessions {
            if tokio::time::timeout_at(deadline, session.closed()).await.is_ok() {
                report.drained += 1;
            } else {
                session.abort(CLOSE_GOING_AWAY, "server shutting down");
                report.forced += 1;
            }
        }

        tracing::info!(
            drained = report.drained,
            forced = report.forced,
            "WebSocket sessions drained"
        );
        report
    }
}
