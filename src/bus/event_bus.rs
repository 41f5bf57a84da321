//! Per-process event bus
//!
//! The bus keeps a registry of subscriptions keyed by `(channel, userID)`.
//! The first subscriber on a channel opens a transport subscription and a
//! fan-out task; later subscribers share it. The last one to leave closes it.
//!
//! # Architecture
//!
//! ```text
//!                           ┌──▶ Slot(user A) ── bounded mpsc ──▶ Subscription::recv()
//! transport ──▶ fan_out() ──┼──▶ Slot(user B) ── bounded mpsc ──▶ Subscription::recv()
//!   (trip:T)                └──▶ Slot(user C) ── full? ──▶ typing: drop
//!                                                       └─▶ other:  evict (Backpressure)
//! ```
//!
//! Every subscriber on a channel sees events in the order the transport
//! delivered them.

use super::transport::{PubSubTransport, TransportSubscription};
use crate::config::BusConfig;
use crate::core::error::RealtimeError;
use crate::core::events::{Channel, Event, EventType};
use crate::core::metrics::RealtimeMetrics;
use crate::core::service::PubSubBackend;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Why a subscription stopped yielding events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// `EventBus::unsubscribe` was called
    Unsubscribed,
    /// The subscriber's cancellation token fired
    Cancelled,
    /// Another subscription with the same key replaced this one
    Replaced,
    /// The subscriber queue was full when a non-droppable event arrived
    Backpressure,
    /// The transport gave up reconnecting
    TransportLost,
    /// The bus shut down
    Shutdown,
}

impl fmt::Display for SubscriptionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionEnd::Unsubscribed => "unsubscribed",
            SubscriptionEnd::Cancelled => "cancelled",
            SubscriptionEnd::Replaced => "replaced",
            SubscriptionEnd::Backpressure => "backpressure",
            SubscriptionEnd::TransportLost => "transport lost",
            SubscriptionEnd::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Termination state shared between a slot and its subscription handle
#[derive(Debug, Default)]
struct EndState {
    reason: OnceLock<SubscriptionEnd>,
    /// Fired when the subscriber must stop immediately, buffered events
    /// included
    closed: CancellationToken,
    /// Fired on every end, transport loss included
    ended: CancellationToken,
}

impl EndState {
    /// Record the end reason; the first reason wins
    fn finish(&self, reason: SubscriptionEnd) {
        let _ = self.reason.set(reason);
        if reason != SubscriptionEnd::TransportLost {
            self.closed.cancel();
        }
        self.ended.cancel();
    }
}

struct Slot {
    id: u64,
    filters: HashSet<EventType>,
    tx: mpsc::Sender<Event>,
    state: Arc<EndState>,
}

struct ChannelEntry {
    generation: u64,
    transport_cancel: CancellationToken,
    subscribers: IndexMap<String, Slot>,
}

struct BusInner {
    transport: PubSubTransport,
    config: BusConfig,
    metrics: Arc<RealtimeMetrics>,
    registry: Mutex<HashMap<Channel, ChannelEntry>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle to one registered subscriber
///
/// Dropping the handle does not unregister it; cancel the token passed to
/// [`EventBus::subscribe`] or call [`EventBus::unsubscribe`].
pub struct Subscription {
    channel: Channel,
    user_id: String,
    rx: mpsc::Receiver<Event>,
    state: Arc<EndState>,
}

impl Subscription {
    /// Next event, or `None` once the subscription ended
    ///
    /// After an unsubscribe, cancellation or eviction no further events are
    /// returned, even if some were still queued.
    pub async fn recv(&mut self) -> Option<Event> {
        if self.state.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.state.closed.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Why the subscription ended, if it did
    pub fn end_reason(&self) -> Option<SubscriptionEnd> {
        self.state.reason.get().copied()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// The in-process event bus
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(
        backend: Arc<dyn PubSubBackend>,
        config: BusConfig,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        let transport = PubSubTransport::new(backend, config.clone(), metrics.clone());
        Self {
            inner: Arc::new(BusInner {
                transport,
                config,
                metrics,
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register `user_id` on `channel` for the given event types
    ///
    /// An existing subscription with the same `(channel, user_id)` key is
    /// replaced. When `cancel` fires the subscription is removed.
    pub async fn subscribe(
        &self,
        cancel: CancellationToken,
        channel: Channel,
        user_id: &str,
        filters: impl IntoIterator<Item = EventType>,
    ) -> Result<Subscription, RealtimeError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RealtimeError::ShuttingDown);
        }

        let mut registry = self.inner.registry.lock().await;

        // The backend subscribe may be slow; other channels keep fanning out
        // while it is pending
        if !registry.contains_key(&channel) {
            drop(registry);
            let opened = self.inner.transport.subscribe(&channel).await?;
            registry = self.inner.registry.lock().await;

            if self.inner.shutdown.is_cancelled() {
                opened.cancel.cancel();
                return Err(RealtimeError::ShuttingDown);
            }
            if registry.contains_key(&channel) {
                // A concurrent subscribe opened the channel first
                opened.cancel.cancel();
            } else {
                self.open_channel(&mut registry, &channel, opened);
            }
        }

        let entry = registry
            .get_mut(&channel)
            .ok_or_else(|| RealtimeError::Internal(format!("channel {} vanished", channel)))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.buffer_size.max(1));
        let state = Arc::new(EndState::default());

        let slot = Slot {
            id,
            filters: filters.into_iter().collect(),
            tx,
            state: state.clone(),
        };
        if let Some(previous) = entry.subscribers.insert(user_id.to_string(), slot) {
            previous.state.finish(SubscriptionEnd::Replaced);
            tracing::debug!(channel = %channel, user_id, "subscription replaced");
        }
        drop(registry);

        self.spawn_cancel_watcher(cancel, channel.clone(), user_id.to_string(), id, state.clone());

        tracing::debug!(channel = %channel, user_id, subscription_id = id, "subscribed");

        Ok(Subscription {
            channel,
            user_id: user_id.to_string(),
            rx,
            state,
        })
    }

    fn open_channel(
        &self,
        registry: &mut HashMap<Channel, ChannelEntry>,
        channel: &Channel,
        opened: TransportSubscription,
    ) {
        let TransportSubscription {
            events,
            cancel: transport_cancel,
        } = opened;
        let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        registry.insert(
            channel.clone(),
            ChannelEntry {
                generation,
                transport_cancel,
                subscribers: IndexMap::new(),
            },
        );
        tokio::spawn(fan_out(
            self.inner.clone(),
            channel.clone(),
            generation,
            events,
        ));
        tracing::info!(channel = %channel, "bus channel opened");
    }

    fn spawn_cancel_watcher(
        &self,
        cancel: CancellationToken,
        channel: Channel,
        user_id: String,
        id: u64,
        state: Arc<EndState>,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    remove_slot(&inner, &channel, &user_id, Some(id), SubscriptionEnd::Cancelled).await;
                }
                _ = state.ended.cancelled() => {}
            }
        });
    }

    /// Remove the subscription of `user_id` on `channel`
    ///
    /// Idempotent. Closes the transport subscription when the last
    /// subscriber of the channel leaves.
    pub async fn unsubscribe(&self, channel: &Channel, user_id: &str) -> Result<(), RealtimeError> {
        remove_slot(&self.inner, channel, user_id, None, SubscriptionEnd::Unsubscribed).await;
        Ok(())
    }

    /// Publish an event on its channel
    ///
    /// Stamps the configured `source` when the event has none. Callers on
    /// write paths log and swallow the error.
    pub async fn publish(&self, mut event: Event) -> Result<(), RealtimeError> {
        event.validate()?;
        if event.source.is_empty() {
            event.source = self.inner.config.source.clone();
        }
        self.inner.transport.publish(&event).await
    }

    /// Publish several events in order
    ///
    /// Every event is validated before any is sent. Returns the first
    /// transport error after attempting all of them.
    pub async fn publish_batch(&self, events: Vec<Event>) -> Result<(), RealtimeError> {
        for event in &events {
            event.validate()?;
        }

        let mut first_error = None;
        for event in events {
            let event_id = event.id;
            if let Err(e) = self.publish(event).await {
                tracing::warn!(event_id = %event_id, error = %e, "batch publish failed for event");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Check that the transport accepts publishes
    pub async fn health_check(&self) -> Result<(), RealtimeError> {
        self.inner.transport.probe().await
    }

    /// Number of subscribers on a channel in this process
    pub async fn subscriber_count(&self, channel: &Channel) -> usize {
        self.inner
            .registry
            .lock()
            .await
            .get(channel)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of channels with an open transport subscription
    pub async fn channel_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// End every subscription and close every transport subscription
    ///
    /// New subscribes fail with `ShuttingDown` afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut registry = self.inner.registry.lock().await;
        for (channel, entry) in registry.drain() {
            for (_, slot) in entry.subscribers {
                slot.state.finish(SubscriptionEnd::Shutdown);
            }
            entry.transport_cancel.cancel();
            tracing::info!(channel = %channel, "bus channel closed on shutdown");
        }
    }
}

/// Remove one slot; `id` restricts removal to a specific subscription so a
/// stale cancel cannot remove its replacement
async fn remove_slot(
    inner: &BusInner,
    channel: &Channel,
    user_id: &str,
    id: Option<u64>,
    reason: SubscriptionEnd,
) {
    let mut registry = inner.registry.lock().await;
    let Some(entry) = registry.get_mut(channel) else {
        return;
    };

    let matches = entry
        .subscribers
        .get(user_id)
        .is_some_and(|slot| id.is_none_or(|id| slot.id == id));
    if !matches {
        return;
    }

    if let Some(slot) = entry.subscribers.shift_remove(user_id) {
        slot.state.finish(reason);
        tracing::debug!(channel = %channel, user_id, %reason, "unsubscribed");
    }

    if entry.subscribers.is_empty() {
        entry.transport_cancel.cancel();
        registry.remove(channel);
        tracing::info!(channel = %channel, "bus channel closed");
    }
}

/// Deliver transport events to every matching subscriber of one channel
async fn fan_out(
    inner: Arc<BusInner>,
    channel: Channel,
    generation: u64,
    mut events: mpsc::Receiver<Event>,
) {
    while let Some(event) = events.recv().await {
        let mut registry = inner.registry.lock().await;
        let Some(entry) = registry
            .get_mut(&channel)
            .filter(|entry| entry.generation == generation)
        else {
            return;
        };

        let mut evicted = Vec::new();
        for (user_id, slot) in entry.subscribers.iter() {
            if !slot.filters.contains(&event.event_type) {
                continue;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => inner.metrics.events_delivered.inc(),
                Err(TrySendError::Full(_)) if event.event_type.is_ephemeral() => {
                    inner.metrics.events_dropped.inc();
                    tracing::debug!(
                        channel = %channel,
                        user_id = %user_id,
                        event_type = %event.event_type,
                        "subscriber queue full, dropping ephemeral event"
                    );
                }
                Err(TrySendError::Full(_)) => {
                    inner.metrics.backpressure_disconnects.inc();
                    tracing::warn!(
                        channel = %channel,
                        user_id = %user_id,
                        event_id = %event.id,
                        "subscriber queue full, evicting slow consumer"
                    );
                    evicted.push((user_id.clone(), SubscriptionEnd::Backpressure));
                }
                Err(TrySendError::Closed(_)) => {
                    evicted.push((user_id.clone(), SubscriptionEnd::Cancelled));
                }
            }
        }

        for (user_id, reason) in evicted {
            if let Some(slot) = entry.subscribers.shift_remove(&user_id) {
                slot.state.finish(reason);
            }
        }

        if entry.subscribers.is_empty() {
            entry.transport_cancel.cancel();
            registry.remove(&channel);
            tracing::info!(channel = %channel, "bus channel closed");
            return;
        }
    }

    // The transport gave up; queued events stay readable, then recv ends
    let mut registry = inner.registry.lock().await;
    let owned = registry
        .get(&channel)
        .is_some_and(|entry| entry.generation == generation);
    if owned && let Some(entry) = registry.remove(&channel) {
        tracing::error!(
            channel = %channel,
            subscribers = entry.subscribers.len(),
            "transport lost, closing subscriptions"
        );
        for (_, slot) in entry.subscribers {
            slot.state.finish(SubscriptionEnd::TransportLost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::TypingStatusPayload;
    use crate::core::service::PayloadStream;
    use crate::storage::InMemoryPubSub;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn bus_with(backend: &InMemoryPubSub, buffer_size: usize) -> (EventBus, Arc<RealtimeMetrics>) {
        let metrics = Arc::new(RealtimeMetrics::new());
        let config = BusConfig {
            buffer_size,
            ..Default::default()
        };
        (
            EventBus::new(Arc::new(backend.clone()), config, metrics.clone()),
            metrics,
        )
    }

    fn chat(trip: &str, n: usize) -> Event {
        Event::new(
            EventType::ChatMessageSent,
            trip,
            "author",
            json!({"messageID": format!("m-{}", n), "content": "hi"}),
        )
        .unwrap()
    }

    fn typing(trip: &str) -> Event {
        Event::new(
            EventType::ChatTypingStatus,
            trip,
            "author",
            TypingStatusPayload { is_typing: true },
        )
        .unwrap()
    }

    async fn recv(sub: &mut Subscription) -> Option<Event> {
        timeout(Duration::from_secs(2), sub.recv()).await.ok().flatten()
    }

    /// Wait until the fan-out has processed everything published so far
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers_in_order() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        let channel = Channel::trip("t1");

        let mut s1 = bus
            .subscribe(CancellationToken::new(), channel.clone(), "u1", EventType::ALL)
            .await
            .unwrap();
        let mut s2 = bus
            .subscribe(CancellationToken::new(), channel.clone(), "u2", EventType::ALL)
            .await
            .unwrap();
        assert_eq!(backend.subscriber_count("trip:t1"), 1);

        let (e1, e2) = (chat("t1", 1), chat("t1", 2));
        bus.publish(e1.clone()).await.unwrap();
        bus.publish(e2.clone()).await.unwrap();

        for sub in [&mut s1, &mut s2] {
            assert_eq!(recv(sub).await.unwrap().id, e1.id);
            assert_eq!(recv(sub).await.unwrap().id, e2.id);
        }
    }

    #[tokio::test]
    async fn test_filters_apply() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);

        let mut sub = bus
            .subscribe(
                CancellationToken::new(),
                Channel::trip("t1"),
                "u1",
                [EventType::ChatMessageSent],
            )
            .await
            .unwrap();

        let skipped = Event::new(EventType::TripUpdated, "t1", "u2", json!({})).unwrap();
        let wanted = chat("t1", 1);
        bus.publish(skipped).await.unwrap();
        bus.publish(wanted.clone()).await.unwrap();

        assert_eq!(recv(&mut sub).await.unwrap().id, wanted.id);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let backend = InMemoryPubSub::new();
        let (bus, metrics) = bus_with(&backend, 2);
        let channel = Channel::trip("t1");

        let mut slow = bus
            .subscribe(CancellationToken::new(), channel.clone(), "slow", EventType::ALL)
            .await
            .unwrap();
        let mut fast = bus
            .subscribe(CancellationToken::new(), channel.clone(), "fast", EventType::ALL)
            .await
            .unwrap();

        for n in 0..3 {
            bus.publish(chat("t1", n)).await.unwrap();
            assert!(recv(&mut fast).await.is_some());
        }
        settle().await;

        assert_eq!(slow.end_reason(), Some(SubscriptionEnd::Backpressure));
        assert!(slow.recv().await.is_none());
        assert_eq!(metrics.backpressure_disconnects.get(), 1);
        assert_eq!(bus.subscriber_count(&channel).await, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_typing_events() {
        let backend = InMemoryPubSub::new();
        let (bus, metrics) = bus_with(&backend, 1);

        let mut sub = bus
            .subscribe(CancellationToken::new(), Channel::trip("t1"), "u1", EventType::ALL)
            .await
            .unwrap();

        let first = typing("t1");
        bus.publish(first.clone()).await.unwrap();
        bus.publish(typing("t1")).await.unwrap();
        settle().await;

        assert_eq!(sub.end_reason(), None);
        assert_eq!(metrics.events_dropped.get(), 1);
        assert_eq!(recv(&mut sub).await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_closes_channel() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        let channel = Channel::trip("t1");

        let mut sub = bus
            .subscribe(CancellationToken::new(), channel.clone(), "u1", EventType::ALL)
            .await
            .unwrap();
        bus.publish(chat("t1", 1)).await.unwrap();
        settle().await;

        bus.unsubscribe(&channel, "u1").await.unwrap();
        bus.unsubscribe(&channel, "u1").await.unwrap();

        assert!(sub.recv().await.is_none());
        assert_eq!(sub.end_reason(), Some(SubscriptionEnd::Unsubscribed));
        assert_eq!(bus.channel_count().await, 0);
        settle().await;
        assert_eq!(backend.subscriber_count("trip:t1"), 0);
    }

    #[tokio::test]
    async fn test_cancel_token_ends_subscription() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        let cancel = CancellationToken::new();

        let mut sub = bus
            .subscribe(cancel.clone(), Channel::trip("t1"), "u1", EventType::ALL)
            .await
            .unwrap();
        cancel.cancel();

        assert!(recv(&mut sub).await.is_none());
        settle().await;
        assert_eq!(sub.end_reason(), Some(SubscriptionEnd::Cancelled));
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        let channel = Channel::trip("t1");

        let first_cancel = CancellationToken::new();
        let mut first = bus
            .subscribe(first_cancel.clone(), channel.clone(), "u1", EventType::ALL)
            .await
            .unwrap();
        let mut second = bus
            .subscribe(CancellationToken::new(), channel.clone(), "u1", EventType::ALL)
            .await
            .unwrap();

        assert!(first.recv().await.is_none());
        assert_eq!(first.end_reason(), Some(SubscriptionEnd::Replaced));

        // A late cancel of the replaced subscription leaves the new one alone
        first_cancel.cancel();
        settle().await;
        assert_eq!(bus.subscriber_count(&channel).await, 1);

        let event = chat("t1", 1);
        bus.publish(event.clone()).await.unwrap();
        assert_eq!(recv(&mut second).await.unwrap().id, event.id);
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_event() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        let event = Event::new(EventType::ChatMessageSent, "", "u1", json!({})).unwrap();

        assert!(matches!(
            bus.publish(event).await,
            Err(RealtimeError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_batch_keeps_order() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        let mut sub = bus
            .subscribe(CancellationToken::new(), Channel::trip("t1"), "u1", EventType::ALL)
            .await
            .unwrap();

        let events: Vec<Event> = (0..5).map(|n| chat("t1", n)).collect();
        let ids: Vec<_> = events.iter().map(|e| e.id).collect();
        bus.publish_batch(events).await.unwrap();

        for id in ids {
            assert_eq!(recv(&mut sub).await.unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn test_health_check_reflects_backend() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        assert!(bus.health_check().await.is_ok());

        backend.set_available(false);
        assert!(bus.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_ends_everything() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        let mut sub = bus
            .subscribe(CancellationToken::new(), Channel::trip("t1"), "u1", EventType::ALL)
            .await
            .unwrap();

        bus.shutdown().await;
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.end_reason(), Some(SubscriptionEnd::Shutdown));

        let again = bus
            .subscribe(CancellationToken::new(), Channel::trip("t1"), "u1", EventType::ALL)
            .await;
        assert!(matches!(again, Err(RealtimeError::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_closes_subscriptions() {
        let backend = InMemoryPubSub::new();
        let (bus, _) = bus_with(&backend, 100);
        let mut sub = bus
            .subscribe(CancellationToken::new(), Channel::trip("t1"), "u1", EventType::ALL)
            .await
            .unwrap();

        backend.set_available(false);
        backend.drop_connections();

        let ended = timeout(Duration::from_secs(600), sub.recv()).await;
        assert!(matches!(ended, Ok(None)));
        assert_eq!(sub.end_reason(), Some(SubscriptionEnd::TransportLost));
        assert_eq!(bus.channel_count().await, 0);

        // The cancel watcher let go of the slot state
        settle().await;
        assert!(sub.state.ended.is_cancelled());
        assert_eq!(Arc::strong_count(&sub.state), 1);
    }

    /// Backend whose subscribe on one channel takes `delay` to be acknowledged
    #[derive(Clone)]
    struct SlowSubscribe {
        inner: InMemoryPubSub,
        slow: &'static str,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl PubSubBackend for SlowSubscribe {
        async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> anyhow::Result<PayloadStream> {
            if channel == self.slow {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.subscribe(channel).await
        }
    }

    fn slow_bus(backend: &InMemoryPubSub, delay: Duration) -> EventBus {
        let slow = SlowSubscribe {
            inner: backend.clone(),
            slow: "trip:slow",
            delay,
        };
        EventBus::new(
            Arc::new(slow),
            BusConfig::default(),
            Arc::new(RealtimeMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_slow_subscribe_does_not_stall_other_channels() {
        let backend = InMemoryPubSub::new();
        let bus = slow_bus(&backend, Duration::from_secs(5));

        let mut fast = bus
            .subscribe(CancellationToken::new(), Channel::trip("fast"), "u1", EventType::ALL)
            .await
            .unwrap();

        let pending = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.subscribe(CancellationToken::new(), Channel::trip("slow"), "u2", EventType::ALL)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = chat("fast", 1);
        bus.publish(event.clone()).await.unwrap();
        let delivered = timeout(Duration::from_millis(500), fast.recv()).await;
        assert_eq!(delivered.unwrap().unwrap().id, event.id);
        assert_eq!(bus.subscriber_count(&Channel::trip("fast")).await, 1);

        pending.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_subscribes_share_one_channel() {
        let backend = InMemoryPubSub::new();
        let bus = slow_bus(&backend, Duration::from_secs(1));
        let channel = Channel::trip("slow");

        let (a, b) = tokio::join!(
            bus.subscribe(CancellationToken::new(), channel.clone(), "u1", EventType::ALL),
            bus.subscribe(CancellationToken::new(), channel.clone(), "u2", EventType::ALL),
        );
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        assert_eq!(bus.subscriber_count(&channel).await, 2);
        assert_eq!(bus.channel_count().await, 1);

        // The losing transport subscription is closed
        settle().await;
        assert_eq!(backend.subscriber_count("trip:slow"), 1);

        let event = chat("slow", 1);
        bus.publish(event.clone()).await.unwrap();
        assert_eq!(recv(&mut a).await.unwrap().id, event.id);
        assert_eq!(recv(&mut b).await.unwrap().id, event.id);
    }
}
