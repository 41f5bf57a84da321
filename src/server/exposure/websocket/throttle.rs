//! Per-session outbound throttling
//!
//! Both helpers take `now` explicitly so they can be driven by a paused
//! tokio clock or by hand in tests.

use crate::core::events::Event;
use std::time::Duration;
use tokio::time::Instant;

/// Single-slot coalescing cell for typing events
///
/// At most one typing event leaves per `interval`. Events arriving in
/// between overwrite the cell; the cell is flushed at the next deadline.
#[derive(Debug)]
pub struct TypingCoalescer {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<Event>,
}

impl TypingCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: None,
        }
    }

    /// Offer an event; returns it back if it may be sent right away
    pub fn offer(&mut self, event: Event, now: Instant) -> Option<Event> {
        let ready = self.pending.is_none()
            && self
                .last_emit
                .is_none_or(|at| now.duration_since(at) >= self.interval);

        if ready {
            self.last_emit = Some(now);
            Some(event)
        } else {
            self.pending = Some(event);
            None
        }
    }

    /// When the held event becomes sendable, if one is held
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(
            self.last_emit
                .map(|at| at + self.interval)
                .unwrap_or_else(Instant::now),
        )
    }

    /// Take the held event if its deadline passed
    pub fn flush(&mut self, now: Instant) -> Option<Event> {
        let deadline = self.next_deadline()?;
        if now < deadline {
            return None;
        }
        self.last_emit = Some(now);
        self.pending.take()
    }
}

/// Token bucket bounding server-side write retries
///
/// Holds `capacity` tokens and refills the whole capacity over `refill`.
#[derive(Debug)]
pub struct RetryBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    updated: Instant,
}

impl RetryBucket {
    pub fn new(capacity: u32, refill: Duration, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        let rate_per_sec = if refill.is_zero() {
            f64::INFINITY
        } else {
            capacity / refill.as_secs_f64()
        };
        Self {
            capacity,
            tokens: capacity,
            rate_per_sec,
            updated: now,
        }
    }

    /// Spend one token if available
    pub fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.updated = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
