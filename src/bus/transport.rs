//! Pub/sub transport adapter
//!
//! Thin layer between the event bus and a [`PubSubBackend`]: it encodes events
//! on publish, decodes them on receive, and keeps one receive loop per
//! subscribed channel alive across backend disconnects.
//!
//! ```text
//! backend stream ──▶ receive_loop ──decode──▶ mpsc ──▶ EventBus fan-out
//!        │                 │
//!    disconnect ──▶ backoff + resubscribe (≤ max_retries) ──▶ give up: close mpsc
//! ```

use crate::config::BusConfig;
use crate::core::error::RealtimeError;
use crate::core::events::{Channel, CodecError, Event};
use crate::core::metrics::RealtimeMetrics;
use crate::core::service::{PayloadStream, PubSubBackend};
use backoff::backoff::Backoff;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Channel used by [`PubSubTransport::probe`]
pub const HEALTH_CHANNEL: &str = "health:probe";

/// A live transport subscription
///
/// `events` closes when the receive loop stops: after `cancel` fires or
/// once reconnecting gave up.
pub struct TransportSubscription {
    pub events: mpsc::Receiver<Event>,
    pub cancel: CancellationToken,
}

/// Encodes, publishes and receives events over a pub/sub backend
#[derive(Clone)]
pub struct PubSubTransport {
    backend: Arc<dyn PubSubBackend>,
    config: BusConfig,
    metrics: Arc<RealtimeMetrics>,
}

impl PubSubTransport {
    pub fn new(
        backend: Arc<dyn PubSubBackend>,
        config: BusConfig,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            backend,
            config,
            metrics,
        }
    }

    /// Publish an event on its channel
    ///
    /// Fails with `TransportUnavailable` when the backend errors or does not
    /// answer within the publish timeout.
    pub async fn publish(&self, event: &Event) -> Result<(), RealtimeError> {
        let channel = event.channel().to_string();
        let payload = event.encode()?;

        match self.send(&channel, payload).await {
            Ok(()) => {
                self.metrics.events_published.inc();
                tracing::debug!(
                    channel = %channel,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "event published"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.event_publish_failures.inc();
                Err(e)
            }
        }
    }

    /// Publish a liveness probe on the reserved health channel
    pub async fn probe(&self) -> Result<(), RealtimeError> {
        self.send(HEALTH_CHANNEL, "ping".to_string()).await
    }

    async fn send(&self, channel: &str, payload: String) -> Result<(), RealtimeError> {
        match timeout(
            self.config.publish_timeout,
            self.backend.publish(channel, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RealtimeError::transport(e)),
            Err(_) => Err(RealtimeError::transport(format!(
                "publish on {} timed out after {:?}",
                channel, self.config.publish_timeout
            ))),
        }
    }

    /// Subscribe to a channel
    ///
    /// Returns once the backend acknowledged the subscription; a receive loop
    /// is then running in the background until the returned token is
    /// cancelled.
    pub async fn subscribe(&self, channel: &Channel) -> Result<TransportSubscription, RealtimeError> {
        let name = channel.to_string();
        let stream = self.open(&name).await?;

        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        let cancel = CancellationToken::new();

        let receiver = ReceiveLoop {
            transport: self.clone(),
            channel: name.clone(),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(receiver.run(stream));

        tracing::info!(channel = %name, "transport subscription opened");

        Ok(TransportSubscription { events: rx, cancel })
    }

    async fn open(&self, channel: &str) -> Result<PayloadStream, RealtimeError> {
        match timeout(self.config.subscribe_timeout, self.backend.subscribe(channel)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(RealtimeError::transport(e)),
            Err(_) => Err(RealtimeError::transport(format!(
                "subscribe to {} timed out after {:?}",
                channel, self.config.subscribe_timeout
            ))),
        }
    }
}

struct ReceiveLoop {
    transport: PubSubTransport,
    channel: String,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    async fn run(self, mut stream: PayloadStream) {
        loop {
            if !self.pump(&mut stream).await {
                return;
            }
            match self.reconnect().await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    /// Forward decoded events until the stream ends
    ///
    /// Returns `false` when the loop must stop for good (cancelled, or the
    /// consumer went away) and `true` on a backend disconnect.
    async fn pump(&self, stream: &mut PayloadStream) -> bool {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                item = stream.next() => item,
            };

            let raw = match item {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => {
                    tracing::warn!(channel = %self.channel, error = %e, "transport receive error");
                    return true;
                }
                None => {
                    tracing::warn!(channel = %self.channel, "transport stream ended");
                    return true;
                }
            };

            match Event::decode(&raw) {
                Ok(event) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        sent = self.tx.send(event) => {
                            if sent.is_err() {
                                return false;
                            }
                        }
                    }
                }
                Err(CodecError::UnknownType(kind)) => {
                    self.transport.metrics.unknown_events.inc();
                    tracing::debug!(channel = %self.channel, kind = %kind, "dropping unknown event type");
                }
                Err(CodecError::Malformed(e)) => {
                    self.transport.metrics.event_decode_errors.inc();
                    tracing::warn!(channel = %self.channel, error = %e, "dropping malformed event");
                }
            }
        }
    }

    /// Resubscribe with exponential backoff
    async fn reconnect(&self) -> Option<PayloadStream> {
        let policy = &self.transport.config.reconnect;
        let mut backoff = policy.build();

        for attempt in 1..=policy.max_retries {
            let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.transport.open(&self.channel).await {
                Ok(stream) => {
                    tracing::info!(channel = %self.channel, attempt, "transport resubscribed");
                    return Some(stream);
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %self.channel,
                        attempt,
                        error = %e,
                        "transport resubscribe failed"
                    );
                }
            }
        }

        tracing::error!(
            channel = %self.channel,
            attempts = policy.max_retries,
            "giving up on transport subscription"
        );
        None
    }
}
