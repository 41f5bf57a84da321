//! Location updates: validation, latest-location storage and offline replay
//!
//! ```text
//! live update ───────────────┐
//!                            ├──▶ LocationService ──▶ LocationStore (latest per member)
//! OfflineLocationQueue ──────┘          │
//!   (lease per user, replay)            └──▶ EventBus: LOCATION_UPDATED on trip:{id}
//! ```

pub mod offline;
pub mod service;

pub use offline::{OfflineBatch, OfflineLocationQueue, ReplayReport};
pub use service::{LocationService, LocationSink};

use crate::core::error::RealtimeError;
use crate::core::membership::MemberRole;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationErrors};

/// A client-reported position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LocationUpdate {
    #[serde(rename = "tripID")]
    #[validate(length(min = 1, message = "trip ID is required"))]
    pub trip_id: String,
    #[validate(range(min = -90.0, max = 90.0, message = "must be within [-90, 90]"))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0, message = "must be within [-180, 180]"))]
    pub longitude: f64,
    #[validate(range(min = 0.0, message = "must not be negative"))]
    pub accuracy: f64,
    /// Client clock, unix milliseconds
    pub timestamp: i64,
}

impl LocationUpdate {
    /// Client timestamp as a date, `None` if out of range
    pub fn client_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// Check coordinate bounds and that the client timestamp lies within
    /// `[now - max_past, now + max_future]`
    ///
    /// Returns the client timestamp on success.
    pub fn check(
        &self,
        now: DateTime<Utc>,
        max_past: Duration,
        max_future: Duration,
    ) -> Result<DateTime<Utc>, RealtimeError> {
        for (field, value) in [
            ("latitude", self.latitude),
            ("longitude", self.longitude),
            ("accuracy", self.accuracy),
        ] {
            if !value.is_finite() {
                return Err(RealtimeError::validation(field, "must be a finite number"));
            }
        }
        self.validate().map_err(first_violation)?;

        let at = self
            .client_time()
            .ok_or_else(|| RealtimeError::validation("timestamp", "out of range"))?;

        let max_past = chrono::Duration::from_std(max_past)
            .map_err(|e| RealtimeError::Internal(e.to_string()))?;
        let max_future = chrono::Duration::from_std(max_future)
            .map_err(|e| RealtimeError::Internal(e.to_string()))?;

        if at < now - max_past {
            return Err(RealtimeError::validation("timestamp", "timestamp too old"));
        }
        if at > now + max_future {
            return Err(RealtimeError::validation("timestamp", "timestamp in the future"));
        }
        Ok(at)
    }
}

/// Turn validator output into a single `Validation` error
///
/// Picks the alphabetically first failing field so the result is stable.
fn first_violation(errors: ValidationErrors) -> RealtimeError {
    let field_errors = errors.field_errors();
    let mut fields: Vec<_> = field_errors.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    match fields.first() {
        Some((field, errs)) => {
            let reason = errs
                .first()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .unwrap_or_else(|| "invalid".to_string());
            RealtimeError::validation(field.to_string(), reason)
        }
        None => RealtimeError::validation("location", errors.to_string()),
    }
}

/// Latest known position of one member in one trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestLocation {
    #[serde(rename = "tripID")]
    pub trip_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp_client: DateTime<Utc>,
    pub timestamp_server: DateTime<Utc>,
}

/// A member's latest location with their trip role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberLocation {
    #[serde(flatten)]
    pub location: LatestLocation,
    pub role: MemberRole,
}

/// Payload of `LOCATION_UPDATED` (envelope carries trip and user)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdatedPayload {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp_client: DateTime<Utc>,
    pub timestamp_server: DateTime<Utc>,
}

impl From<&LatestLocation> for LocationUpdatedPayload {
    fn from(location: &LatestLocation) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            accuracy: location.accuracy,
            timestamp_client: location.timestamp_client,
            timestamp_server: location.timestamp_server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAST: Duration = Duration::from_secs(2 * 3600);
    const FUTURE: Duration = Duration::from_secs(300);

    fn update(lat: f64, long: f64, accuracy: f64, at: DateTime<Utc>) -> LocationUpdate {
        LocationUpdate {
            trip_id: "trip-1".to_string(),
            latitude: lat,
            longitude: long,
            accuracy,
            timestamp: at.timestamp_millis(),
        }
    }

    fn field_of(err: RealtimeError) -> String {
        match err {
            RealtimeError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_accepts_valid_update() {
        let now = Utc::now();
        let at = update(38.7, -9.1, 12.0, now).check(now, PAST, FUTURE).unwrap();
        assert_eq!(at.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        let now = Utc::now();
        let err = update(90.5, 0.0, 1.0, now).check(now, PAST, FUTURE).unwrap_err();
        assert_eq!(field_of(err), "latitude");

        let err = update(0.0, -180.1, 1.0, now).check(now, PAST, FUTURE).unwrap_err();
        assert_eq!(field_of(err), "longitude");

        let err = update(0.0, 0.0, -1.0, now).check(now, PAST, FUTURE).unwrap_err();
        assert_eq!(field_of(err), "accuracy");

        let err = update(f64::NAN, 0.0, 1.0, now).check(now, PAST, FUTURE).unwrap_err();
        assert_eq!(field_of(err), "latitude");
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let now = Utc::now();
        assert!(update(-90.0, 180.0, 0.0, now).check(now, PAST, FUTURE).is_ok());
        assert!(update(90.0, -180.0, 0.0, now).check(now, PAST, FUTURE).is_ok());
    }

    #[test]
    fn test_timestamp_window() {
        let now = Utc::now();
        let old = now - chrono::Duration::hours(3);
        let err = update(0.0, 0.0, 1.0, old).check(now, PAST, FUTURE).unwrap_err();
        assert_eq!(field_of(err), "timestamp");

        let ahead = now + chrono::Duration::minutes(6);
        let err = update(0.0, 0.0, 1.0, ahead).check(now, PAST, FUTURE).unwrap_err();
        assert_eq!(field_of(err), "timestamp");

        let skewed = now + chrono::Duration::minutes(4);
        assert!(update(0.0, 0.0, 1.0, skewed).check(now, PAST, FUTURE).is_ok());
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::json!({
            "tripID": "t1",
            "latitude": 1.5,
            "longitude": 2.5,
            "accuracy": 3.0,
            "timestamp": 1714564800000i64
        });
        let update: LocationUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(update.trip_id, "t1");
        assert_eq!(update.client_time().unwrap().timestamp(), 1714564800);
    }
}
