//! RealtimeBuilder for fluent API to build the realtime server

use super::exposure::WebSocketExposure;
use super::host::{HostComponents, RealtimeHost};
use crate::config::RealtimeConfig;
use crate::core::auth::TokenValidator;
use crate::core::clock::{Clock, SystemClock};
use crate::core::service::{KeyValueStore, LocationStore, MembershipStore, PubSubBackend};
use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Builder for the realtime host and its router
///
/// With the `in-memory` feature, backends that were not set default to
/// the in-process implementations. Without it every backend is required.
///
/// # Example
///
/// ```ignore
/// let app = RealtimeBuilder::new()
///     .with_config(RealtimeConfig::from_env())
///     .with_token_validator(StaticTokenValidator::new().with_token("t0k3n", "user-1"))
///     .build()?;
/// ```
pub struct RealtimeBuilder {
    config: RealtimeConfig,
    key_value: Option<Arc<dyn KeyValueStore>>,
    pubsub: Option<Arc<dyn PubSubBackend>>,
    locations: Option<Arc<dyn LocationStore>>,
    memberships: Option<Arc<dyn MembershipStore>>,
    token_validator: Option<Arc<dyn TokenValidator>>,
    clock: Option<Arc<dyn Clock>>,
    custom_routes: Vec<Router>,
}

impl RealtimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RealtimeConfig::default(),
            key_value: None,
            pubsub: None,
            locations: None,
            memberships: None,
            token_validator: None,
            clock: None,
            custom_routes: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: RealtimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_key_value(mut self, store: impl KeyValueStore + 'static) -> Self {
        self.key_value = Some(Arc::new(store));
        self
    }

    pub fn with_pubsub(mut self, backend: impl PubSubBackend + 'static) -> Self {
        self.pubsub = Some(Arc::new(backend));
        self
    }

    pub fn with_location_store(mut self, store: impl LocationStore + 'static) -> Self {
        self.locations = Some(Arc::new(store));
        self
    }

    pub fn with_membership_store(mut self, store: impl MembershipStore + 'static) -> Self {
        self.memberships = Some(Arc::new(store));
        self
    }

    /// Set the token validator (required)
    pub fn with_token_validator(mut self, validator: impl TokenValidator + 'static) -> Self {
        self.token_validator = Some(Arc::new(validator));
        self
    }

    /// Override the clock; defaults to the system clock
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Add routes served next to the WebSocket endpoints
    ///
    /// # Example
    ///
    /// ```ignore
    /// let auth_routes = Router::new().route("/auth/login", post(login_handler));
    ///
    /// RealtimeBuilder::new()
    ///     .with_token_validator(validator)
    ///     .with_custom_routes(auth_routes)
    ///     .build()?;
    /// ```
    pub fn with_custom_routes(mut self, routes: Router) -> Self {
        self.custom_routes.push(routes);
        self
    }

    /// Build the transport-agnostic host
    pub fn build_host(self) -> Result<RealtimeHost> {
        let (host, _) = self.into_host()?;
        Ok(host)
    }

    fn into_host(mut self) -> Result<(RealtimeHost, Vec<Router>)> {
        let token_validator = self.token_validator.take().ok_or_else(|| {
            anyhow::anyhow!("TokenValidator is required. Call .with_token_validator()")
        })?;

        #[cfg(feature = "in-memory")]
        let components = {
            use crate::storage::{
                InMemoryKeyValue, InMemoryLocationStore, InMemoryMembershipStore, InMemoryPubSub,
            };
            HostComponents {
                key_value: self
                    .key_value
                    .take()
                    .unwrap_or_else(|| Arc::new(InMemoryKeyValue::new())),
                pubsub: self
                    .pubsub
                    .take()
                    .unwrap_or_else(|| Arc::new(InMemoryPubSub::new())),
                locations: self
                    .locations
                    .take()
                    .unwrap_or_else(|| Arc::new(InMemoryLocationStore::new())),
                memberships: self
                    .memberships
                    .take()
                    .unwrap_or_else(|| Arc::new(InMemoryMembershipStore::new())),
                token_validator,
                clock: self.clock.take().unwrap_or_else(|| Arc::new(SystemClock)),
                config: self.config,
            }
        };

        #[cfg(not(feature = "in-memory"))]
        let components = HostComponents {
            key_value: self.key_value.take().ok_or_else(|| {
                anyhow::anyhow!("KeyValueStore is required. Call .with_key_value()")
            })?,
            pubsub: self
                .pubsub
                .take()
                .ok_or_else(|| anyhow::anyhow!("PubSubBackend is required. Call .with_pubsub()"))?,
            locations: self.locations.take().ok_or_else(|| {
                anyhow::anyhow!("LocationStore is required. Call .with_location_store()")
            })?,
            memberships: self.memberships.take().ok_or_else(|| {
                anyhow::anyhow!("MembershipStore is required. Call .with_membership_store()")
            })?,
            token_validator,
            clock: self.clock.take().unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
        };

        Ok((RealtimeHost::from_components(components), self.custom_routes))
    }

    /// Build the host and its router
    ///
    /// The host is returned alongside so callers can shut it down.
    pub fn build_with_host(self) -> Result<(Arc<RealtimeHost>, Router)> {
        let (host, custom_routes) = self.into_host()?;
        let host = Arc::new(host);

        let mut router = WebSocketExposure::build_router(host.clone())?;
        for routes in custom_routes {
            router = router.merge(routes);
        }
        Ok((host, router))
    }

    /// Build the final router
    pub fn build(self) -> Result<Router> {
        let (_, router) = self.build_with_host()?;
        Ok(router)
    }

    /// Serve with graceful shutdown
    ///
    /// On SIGTERM or Ctrl+C the sessions are drained within the configured
    /// grace period before the listener stops.
    ///
    /// # Example
    ///
    /// ```ignore
    /// RealtimeBuilder::new()
    ///     .with_token_validator(validator)
    ///     .serve("127.0.0.1:8080").await?;
    /// ```
    pub async fn serve(self, addr: &str) -> Result<()> {
        let (host, app) = self.build_with_host()?;
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Server listening on {}", addr);

        let draining = host.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let report = draining.shutdown_gracefully().await;
            tracing::info!(drained = report.drained, forced = report.forced, "sessions closed");
        })
        .await?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

impl Default for RealtimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, initiating graceful shutdown...");
        },
    }
}

#[cfg(all(test, feature = "in-memory"))]
mod tests {
    use super::*;
    use crate::core::auth::StaticTokenValidator;
    use crate::core::clock::ManualClock;
    use axum::routing::get;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_token_validator_is_required() {
        let err = RealtimeBuilder::new().build_host().err().unwrap();
        assert!(err.to_string().contains("TokenValidator is required"));
    }

    #[test]
    fn test_defaults_to_in_memory_backends() {
        let host = RealtimeBuilder::new()
            .with_token_validator(StaticTokenValidator::new())
            .build_host()
            .unwrap();
        assert_eq!(host.config.bus.buffer_size, 100);
    }

    #[test]
    fn test_custom_clock_and_config() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut config = RealtimeConfig::default();
        config.bus.buffer_size = 7;

        let host = RealtimeBuilder::new()
            .with_config(config)
            .with_clock(ManualClock::new(at))
            .with_token_validator(StaticTokenValidator::new())
            .build_host()
            .unwrap();

        assert_eq!(host.clock.now(), at);
        assert_eq!(host.config.bus.buffer_size, 7);
    }

    #[tokio::test]
    async fn test_custom_routes_are_merged() {
        use tower::ServiceExt;

        let router = RealtimeBuilder::new()
            .with_token_validator(StaticTokenValidator::new())
            .with_custom_routes(Router::new().route("/ping", get(|| async { "pong" })))
            .build()
            .unwrap();

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ping")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
