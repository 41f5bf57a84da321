//! In-process counters for the real-time core
//!
//! Nothing here is exported over the network; the registry exists so the
//! degraded paths (dropped events, fail-open rate limiting, backpressure
//! disconnects) are observable from tests and diagnostics endpoints.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A value that moves both ways
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters shared by every component of one service process
#[derive(Debug, Default)]
pub struct RealtimeMetrics {
    pub events_published: Counter,
    pub event_publish_failures: Counter,
    pub events_delivered: Counter,
    pub events_dropped: Counter,
    pub unknown_events: Counter,
    pub event_decode_errors: Counter,
    pub backpressure_disconnects: Counter,
    pub rate_limiter_unavailable: Counter,
    pub websocket_active_connections: Gauge,
    pub websocket_messages_received: Counter,
    pub websocket_errors: Counter,
    pub offline_updates_replayed: Counter,
    pub offline_updates_skipped: Counter,
}

/// Point-in-time copy of [`RealtimeMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub events_published_total: u64,
    pub event_publish_failures_total: u64,
    pub events_delivered_total: u64,
    pub events_dropped_total: u64,
    pub unknown_events_total: u64,
    pub event_decode_errors_total: u64,
    pub backpressure_disconnects_total: u64,
    pub rate_limiter_unavailable_total: u64,
    pub websocket_active_connections: i64,
    pub websocket_messages_received_total: u64,
    pub websocket_errors_total: u64,
    pub offline_updates_replayed_total: u64,
    pub offline_updates_skipped_total: u64,
}

impl RealtimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published_total: self.events_published.get(),
            event_publish_failures_total: self.event_publish_failures.get(),
            events_delivered_total: self.events_delivered.get(),
            events_dropped_total: self.events_dropped.get(),
            unknown_events_total: self.unknown_events.get(),
            event_decode_errors_total: self.event_decode_errors.get(),
            backpressure_disconnects_total: self.backpressure_disconnects.get(),
            rate_limiter_unavailable_total: self.rate_limiter_unavailable.get(),
            websocket_active_connections: self.websocket_active_connections.get(),
            websocket_messages_received_total: self.websocket_messages_received.get(),
            websocket_errors_total: self.websocket_errors.get(),
            offline_updates_replayed_total: self.offline_updates_replayed.get(),
            offline_updates_skipped_total: self.offline_updates_skipped.get(),
        }
    }
}
