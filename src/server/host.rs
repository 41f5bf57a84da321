//! Server host holding the shared realtime components
//!
//! The host is transport-agnostic: it owns the bus, limiter, location
//! services and session registry, and exposures (WebSocket, the demo's
//! HTTP routes) borrow it through an `Arc`.

use super::exposure::websocket::{ConnectionManager, ShutdownReport};
use crate::bus::EventBus;
use crate::config::RealtimeConfig;
use crate::core::auth::TokenValidator;
use crate::core::clock::Clock;
use crate::core::error::RealtimeError;
use crate::core::membership::TripAuthorizer;
use crate::core::metrics::RealtimeMetrics;
use crate::core::service::{KeyValueStore, LocationStore, MembershipStore, PubSubBackend};
use crate::location::{LocationService, OfflineLocationQueue};
use crate::ratelimit::RateLimiter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Backends a host is assembled from
pub struct HostComponents {
    pub config: RealtimeConfig,
    pub key_value: Arc<dyn KeyValueStore>,
    pub pubsub: Arc<dyn PubSubBackend>,
    pub locations: Arc<dyn LocationStore>,
    pub memberships: Arc<dyn MembershipStore>,
    pub token_validator: Arc<dyn TokenValidator>,
    pub clock: Arc<dyn Clock>,
}

/// Result of [`RealtimeHost::health`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub pubsub: bool,
    pub key_value: bool,
    pub connections: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.pubsub && self.key_value
    }
}

/// Host context containing all realtime state
pub struct RealtimeHost {
    pub config: Arc<RealtimeConfig>,
    pub metrics: Arc<RealtimeMetrics>,
    pub clock: Arc<dyn Clock>,
    pub key_value: Arc<dyn KeyValueStore>,
    pub event_bus: EventBus,
    pub rate_limiter: Arc<RateLimiter>,
    pub authorizer: TripAuthorizer,
    pub token_validator: Arc<dyn TokenValidator>,
    pub locations: LocationService,
    pub offline_queue: OfflineLocationQueue,
    pub connections: Arc<ConnectionManager>,
}

impl RealtimeHost {
    /// Wire every component from its backends
    pub fn from_components(components: HostComponents) -> Self {
        let HostComponents {
            config,
            key_value,
            pubsub,
            locations,
            memberships,
            token_validator,
            clock,
        } = components;

        let config = Arc::new(config);
        let metrics = Arc::new(RealtimeMetrics::new());

        let event_bus = EventBus::new(pubsub, config.bus.clone(), metrics.clone());
        let rate_limiter = Arc::new(RateLimiter::new(
            key_value.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let authorizer = TripAuthorizer::new(memberships);
        let location_service = LocationService::new(
            locations,
            event_bus.clone(),
            authorizer.clone(),
            clock.clone(),
            config.location.clone(),
        );
        let offline_queue = OfflineLocationQueue::new(
            key_value.clone(),
            Arc::new(location_service.clone()),
            authorizer.clone(),
            clock.clone(),
            config.offline.clone(),
            metrics.clone(),
        );
        let connections = Arc::new(ConnectionManager::new(metrics.clone()));

        Self {
            config,
            metrics,
            clock,
            key_value,
            event_bus,
            rate_limiter,
            authorizer,
            token_validator,
            locations: location_service,
            offline_queue,
            connections,
        }
    }

    /// Probe the pub/sub and key-value backends
    pub async fn health(&self) -> HealthReport {
        let pubsub = match self.event_bus.health_check().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "pub/sub health check failed");
                false
            }
        };
        let key_value = match self.key_value.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "key-value health check failed");
                false
            }
        };

        HealthReport {
            pubsub,
            key_value,
            connections: self.connections.connection_count().await,
        }
    }

    /// Stop sessions first, then the bus
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let report = self.connections.shutdown(grace).await;
        self.event_bus.shutdown().await;
        report
    }

    /// Shorthand for `shutdown` with the configured grace period
    pub async fn shutdown_gracefully(&self) -> ShutdownReport {
        self.shutdown(self.config.session.shutdown_grace).await
    }

    /// Error returned to callers once the host stopped accepting sessions
    pub fn ensure_accepting(&self) -> Result<(), RealtimeError> {
        if self.connections.is_accepting() {
            Ok(())
        } else {
            Err(RealtimeError::ShuttingDown)
        }
    }
}

#[cfg(all(test, feature = "in-memory"))]
mod tests {
    use super::*;
    use crate::core::auth::StaticTokenValidator;
    use crate::core::clock::SystemClock;
    use crate::storage::{
        InMemoryKeyValue, InMemoryLocationStore, InMemoryMembershipStore, InMemoryPubSub,
    };

    fn make_host(kv: InMemoryKeyValue, pubsub: InMemoryPubSub) -> RealtimeHost {
        RealtimeHost::from_components(HostComponents {
            config: RealtimeConfig::default(),
            key_value: Arc::new(kv),
            pubsub: Arc::new(pubsub),
            locations: Arc::new(InMemoryLocationStore::new()),
            memberships: Arc::new(InMemoryMembershipStore::new()),
            token_validator: Arc::new(StaticTokenValidator::new()),
            clock: Arc::new(SystemClock),
        })
    }

    #[tokio::test]
    async fn test_health_reports_each_backend() {
        let kv = InMemoryKeyValue::new();
        let pubsub = InMemoryPubSub::new();
        let host = make_host(kv.clone(), pubsub.clone());

        let report = host.health().await;
        assert!(report.is_healthy());
        assert_eq!(report.connections, 0);

        pubsub.set_available(false);
        let report = host.health().await;
        assert!(!report.pubsub);
        assert!(report.key_value);

        kv.set_available(false);
        assert!(!host.health().await.key_value);
    }

    #[tokio::test]
    async fn test_shutdown_stops_new_sessions_and_subscriptions() {
        let host = make_host(InMemoryKeyValue::new(), InMemoryPubSub::new());

        let report = host.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report, ShutdownReport::default());
        assert!(matches!(host.ensure_accepting(), Err(RealtimeError::ShuttingDown)));

        let err = host
            .event_bus
            .subscribe(
                tokio_util::sync::CancellationToken::new(),
                crate::core::events::Channel::trip("t1"),
                "u1",
                crate::core::events::EventType::ALL,
            )
            .await
            .err();
        assert!(matches!(err, Some(RealtimeError::ShuttingDown)));
    }
}
