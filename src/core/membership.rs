//! Trip roles and the authorization helper
//!
//! Every path that exposes trip data (opening a trip-chat socket, reading
//! member locations, replaying offline updates) asks [`TripAuthorizer`]
//! whether the user holds at least a given role in the trip.

use crate::core::error::RealtimeError;
use crate::core::service::MembershipStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A user's role in a trip, ordered `Viewer < Member < Admin < Owner`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Viewer => "VIEWER",
            MemberRole::Member => "MEMBER",
            MemberRole::Admin => "ADMIN",
            MemberRole::Owner => "OWNER",
        }
    }

    /// Whether this role satisfies `required`
    pub fn is_authorized_for(&self, required: MemberRole) -> bool {
        *self >= required
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberRole {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VIEWER" => Ok(MemberRole::Viewer),
            "MEMBER" => Ok(MemberRole::Member),
            "ADMIN" => Ok(MemberRole::Admin),
            "OWNER" => Ok(MemberRole::Owner),
            other => Err(RealtimeError::validation(
                "role",
                format!("unknown role '{}'", other),
            )),
        }
    }
}

/// Resolves membership and enforces the role hierarchy
#[derive(Clone)]
pub struct TripAuthorizer {
    store: Arc<dyn MembershipStore>,
}

impl TripAuthorizer {
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self { store }
    }

    /// Check that `user_id` holds at least `min_role` in `trip_id`
    ///
    /// Returns the user's actual role. `NotMember` when there is no record,
    /// `Forbidden` when the role is too low, `Database` on store failure.
    pub async fn check_role(
        &self,
        trip_id: &str,
        user_id: &str,
        min_role: MemberRole,
    ) -> Result<MemberRole, RealtimeError> {
        let role = self
            .store
            .get_role(trip_id, user_id)
            .await
            .map_err(|e| {
                tracing::error!(trip_id, user_id, error = %e, "membership lookup failed");
                RealtimeError::database(e)
            })?
            .ok_or_else(|| RealtimeError::NotMember {
                trip_id: trip_id.to_string(),
                user_id: user_id.to_string(),
            })?;

        if !role.is_authorized_for(min_role) {
            tracing::debug!(trip_id, user_id, %role, required = %min_role, "insufficient trip role");
            return Err(RealtimeError::forbidden(format!(
                "role {} is below required {}",
                role, min_role
            )));
        }

        Ok(role)
    }

    /// Role lookup without enforcement
    pub async fn role_of(
        &self,
        trip_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRole>, RealtimeError> {
        self.store
            .get_role(trip_id, user_id)
            .await
            .map_err(RealtimeError::database)
    }
}
