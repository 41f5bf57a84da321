//! Location validator and emitter

use super::{LatestLocation, LocationUpdate, LocationUpdatedPayload, MemberLocation};
use crate::bus::EventBus;
use crate::config::LocationConfig;
use crate::core::clock::Clock;
use crate::core::error::RealtimeError;
use crate::core::events::{Event, EventType};
use crate::core::membership::{MemberRole, TripAuthorizer};
use crate::core::service::LocationStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const SOURCE: &str = "location-service";

/// What the offline queue needs from the location pipeline
///
/// Applying a replayed update runs the same validation, storage and event
/// emission as a live one; only the freshness window differs.
#[async_trait]
pub trait LocationSink: Send + Sync {
    async fn apply_replayed(
        &self,
        user_id: &str,
        update: &LocationUpdate,
        max_age: Duration,
    ) -> Result<LatestLocation, RealtimeError>;
}

/// Validates, stores and publishes location updates
#[derive(Clone)]
pub struct LocationService {
    store: Arc<dyn LocationStore>,
    bus: EventBus,
    authorizer: TripAuthorizer,
    clock: Arc<dyn Clock>,
    config: LocationConfig,
}

impl LocationService {
    pub fn new(
        store: Arc<dyn LocationStore>,
        bus: EventBus,
        authorizer: TripAuthorizer,
        clock: Arc<dyn Clock>,
        config: LocationConfig,
    ) -> Self {
        Self {
            store,
            bus,
            authorizer,
            clock,
            config,
        }
    }

    /// Apply a live update
    ///
    /// `Validation` on bad input, `Database` if the store write fails. A
    /// failed publish is logged and otherwise ignored.
    pub async fn update_location(
        &self,
        user_id: &str,
        update: &LocationUpdate,
    ) -> Result<LatestLocation, RealtimeError> {
        self.apply(user_id, update, self.config.max_past).await
    }

    async fn apply(
        &self,
        user_id: &str,
        update: &LocationUpdate,
        max_past: Duration,
    ) -> Result<LatestLocation, RealtimeError> {
        let now = self.clock.now();
        let timestamp_client = update.check(now, max_past, self.config.max_future)?;

        let location = LatestLocation {
            trip_id: update.trip_id.clone(),
            user_id: user_id.to_string(),
            latitude: update.latitude,
            longitude: update.longitude,
            accuracy: update.accuracy,
            timestamp_client,
            timestamp_server: now,
        };

        let stored = self.store.upsert_latest(location).await.map_err(|e| {
            tracing::error!(user_id, trip_id = %update.trip_id, error = %e, "failed to store location");
            RealtimeError::database(e)
        })?;

        self.emit(&stored).await;
        Ok(stored)
    }

    async fn emit(&self, location: &LatestLocation) {
        let event = match Event::new(
            EventType::LocationUpdated,
            location.trip_id.clone(),
            location.user_id.clone(),
            LocationUpdatedPayload::from(location),
        ) {
            Ok(event) => event.with_source(SOURCE),
            Err(e) => {
                tracing::error!(user_id = %location.user_id, error = %e, "failed to build location event");
                return;
            }
        };

        let event_id = event.id;
        if let Err(e) = self.bus.publish(event).await {
            tracing::warn!(
                user_id = %location.user_id,
                trip_id = %location.trip_id,
                event_id = %event_id,
                error = %e,
                "failed to publish location update"
            );
        }
    }

    /// Latest locations of every member of a trip
    ///
    /// The requester must be at least `Member`. Locations older than the
    /// visibility window, and locations of users who left, are omitted.
    pub async fn get_trip_member_locations(
        &self,
        trip_id: &str,
        requester_id: &str,
    ) -> Result<Vec<MemberLocation>, RealtimeError> {
        match self
            .authorizer
            .check_role(trip_id, requester_id, MemberRole::Member)
            .await
        {
            Ok(_) => {}
            Err(RealtimeError::NotMember { .. }) => {
                return Err(RealtimeError::forbidden(
                    "user is not a member of this trip",
                ));
            }
            Err(e) => return Err(e),
        }

        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.visibility_window)
                .map_err(|e| RealtimeError::Internal(e.to_string()))?;

        let locations = self
            .store
            .list_trip_locations(trip_id)
            .await
            .map_err(RealtimeError::database)?;

        let mut members = Vec::with_capacity(locations.len());
        for location in locations {
            if location.timestamp_client < cutoff {
                continue;
            }
            if let Some(role) = self.authorizer.role_of(trip_id, &location.user_id).await? {
                members.push(MemberLocation { location, role });
            }
        }
        Ok(members)
    }
}

#[async_trait]
impl LocationSink for LocationService {
    async fn apply_replayed(
        &self,
        user_id: &str,
        update: &LocationUpdate,
        max_age: Duration,
    ) -> Result<LatestLocation, RealtimeError> {
        self.apply(user_id, update, max_age).await
    }
}
