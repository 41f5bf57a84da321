//! Offline location queue
//!
//! Clients that were offline upload their buffered positions in batches.
//! Each batch is parked in the key-value store and replayed later by
//! whichever worker holds the user's lease:
//!
//! ```text
//! offline_location_queue:{userID}:{batchID}   JSON batch, TTL 24h
//! offline_location_lock:{userID}              lease token, TTL 5min, SET NX
//! ```
//!
//! A crashed worker's lease simply expires. Re-applying a batch is harmless
//! because the latest-location write is idempotent per client timestamp.

use super::service::LocationSink;
use super::LocationUpdate;
use crate::config::OfflineConfig;
use crate::core::clock::Clock;
use crate::core::error::RealtimeError;
use crate::core::membership::{MemberRole, TripAuthorizer};
use crate::core::metrics::RealtimeMetrics;
use crate::core::service::{KeyValueStore, escape_glob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const QUEUE_PREFIX: &str = "offline_location_queue:";
pub const LOCK_PREFIX: &str = "offline_location_lock:";

/// One uploaded batch, as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineBatch {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub updates: Vec<LocationUpdate>,
}

/// Outcome of one [`OfflineLocationQueue::process_offline_locations`] run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// `false` when another worker held the lease
    pub lock_acquired: bool,
    pub batches: usize,
    /// Undecodable, foreign or expired batches that were deleted unread
    pub discarded_batches: usize,
    pub replayed: usize,
    pub skipped: usize,
}

/// Parks offline batches and replays them under a per-user lease
#[derive(Clone)]
pub struct OfflineLocationQueue {
    store: Arc<dyn KeyValueStore>,
    sink: Arc<dyn LocationSink>,
    authorizer: TripAuthorizer,
    clock: Arc<dyn Clock>,
    config: OfflineConfig,
    metrics: Arc<RealtimeMetrics>,
}

impl OfflineLocationQueue {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        sink: Arc<dyn LocationSink>,
        authorizer: TripAuthorizer,
        clock: Arc<dyn Clock>,
        config: OfflineConfig,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            store,
            sink,
            authorizer,
            clock,
            config,
            metrics,
        }
    }

    /// Park a batch for later replay
    ///
    /// Returns the batch key, or `None` for an empty batch (nothing is
    /// written). Batches above the configured size are rejected.
    pub async fn save_offline_locations(
        &self,
        user_id: &str,
        updates: Vec<LocationUpdate>,
        device_id: &str,
    ) -> Result<Option<String>, RealtimeError> {
        if updates.is_empty() {
            return Ok(None);
        }
        if updates.len() > self.config.max_batch_size {
            return Err(RealtimeError::validation(
                "updates",
                format!(
                    "batch of {} exceeds the limit of {}",
                    updates.len(),
                    self.config.max_batch_size
                ),
            ));
        }

        let count = updates.len();
        let batch = OfflineBatch {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            created_at: self.clock.now(),
            updates,
        };
        let data = serde_json::to_string(&batch)
            .map_err(|e| RealtimeError::Internal(format!("failed to encode batch: {}", e)))?;

        let key = format!("{}{}:{}", QUEUE_PREFIX, user_id, Uuid::new_v4());
        self.store
            .set_ex(&key, &data, self.config.batch_ttl)
            .await
            .map_err(|e| {
                tracing::error!(user_id, error = %e, "failed to save offline batch");
                RealtimeError::transport(e)
            })?;

        tracing::info!(user_id, device_id, count, key = %key, "saved offline location batch");
        Ok(Some(key))
    }

    /// Replay every parked batch of `user_id`
    ///
    /// Returns immediately with `lock_acquired = false` if another worker
    /// holds the lease or the lease could not be requested.
    pub async fn process_offline_locations(&self, user_id: &str) -> Result<ReplayReport, RealtimeError> {
        let lock_key = format!("{}{}", LOCK_PREFIX, user_id);
        let token = Uuid::new_v4().to_string();

        match self
            .store
            .set_nx_ex(&lock_key, &token, self.config.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(user_id, "offline replay already in progress elsewhere");
                return Ok(ReplayReport::default());
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "could not request offline replay lease");
                return Ok(ReplayReport::default());
            }
        }

        let mut report = ReplayReport {
            lock_acquired: true,
            ..Default::default()
        };
        let result = self.drain(user_id, &mut report).await;

        match self.store.compare_and_delete(&lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(user_id, "offline replay lease expired before release"),
            Err(e) => tracing::error!(user_id, error = %e, "failed to release offline replay lease"),
        }

        result?;
        tracing::info!(
            user_id,
            batches = report.batches,
            discarded = report.discarded_batches,
            replayed = report.replayed,
            skipped = report.skipped,
            "offline replay finished"
        );
        Ok(report)
    }

    async fn drain(&self, user_id: &str, report: &mut ReplayReport) -> Result<(), RealtimeError> {
        let prefix = format!("{}{}:", QUEUE_PREFIX, user_id);
        let pattern = format!("{}{}:*", QUEUE_PREFIX, escape_glob(user_id));
        let keys: Vec<String> = self
            .store
            .keys(&pattern)
            .await
            .map_err(RealtimeError::transport)?
            .into_iter()
            .filter(|key| is_batch_key(key, &prefix))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| RealtimeError::Internal(e.to_string()))?;

        let mut pending = Vec::new();
        let mut drained = Vec::new();
        for key in keys {
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(user_id, key = %key, error = %e, "failed to read offline batch");
                    continue;
                }
            };
            report.batches += 1;

            let batch = match serde_json::from_str::<OfflineBatch>(&raw) {
                Ok(batch) if batch.user_id == user_id => batch,
                Ok(_) => {
                    tracing::warn!(user_id, key = %key, "offline batch belongs to another user");
                    self.discard(&key, report).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(user_id, key = %key, error = %e, "undecodable offline batch");
                    self.discard(&key, report).await;
                    continue;
                }
            };

            if now - batch.created_at > max_age {
                tracing::info!(user_id, key = %key, "discarding expired offline batch");
                self.discard(&key, report).await;
                continue;
            }

            pending.extend(batch.updates);
            drained.push(key);
        }

        pending.sort_by_key(|update| update.timestamp);

        let mut membership: HashMap<String, bool> = HashMap::new();
        for update in &pending {
            if update
                .client_time()
                .is_none_or(|at| now - at > max_age)
            {
                self.skip(report);
                continue;
            }

            if !self.is_member(user_id, &update.trip_id, &mut membership).await {
                self.skip(report);
                continue;
            }

            match self
                .sink
                .apply_replayed(user_id, update, self.config.max_age)
                .await
            {
                Ok(_) => {
                    report.replayed += 1;
                    self.metrics.offline_updates_replayed.inc();
                }
                Err(e) => {
                    tracing::warn!(
                        user_id,
                        trip_id = %update.trip_id,
                        timestamp = update.timestamp,
                        error = %e,
                        "skipping offline location update"
                    );
                    self.skip(report);
                }
            }
        }

        for key in drained {
            if let Err(e) = self.store.delete(&key).await {
                tracing::warn!(user_id, key = %key, error = %e, "failed to delete replayed batch");
            }
        }
        Ok(())
    }

    /// Membership lookup, cached per trip for one run
    async fn is_member(
        &self,
        user_id: &str,
        trip_id: &str,
        cache: &mut HashMap<String, bool>,
    ) -> bool {
        if let Some(known) = cache.get(trip_id) {
            return *known;
        }
        match self
            .authorizer
            .check_role(trip_id, user_id, MemberRole::Member)
            .await
        {
            Ok(_) => {
                cache.insert(trip_id.to_string(), true);
                true
            }
            Err(RealtimeError::NotMember { .. } | RealtimeError::Forbidden { .. }) => {
                tracing::info!(user_id, trip_id, "skipping offline updates for trip without membership");
                cache.insert(trip_id.to_string(), false);
                false
            }
            Err(e) => {
                tracing::warn!(user_id, trip_id, error = %e, "membership check failed during replay");
                false
            }
        }
    }

    async fn discard(&self, key: &str, report: &mut ReplayReport) {
        report.discarded_batches += 1;
        if let Err(e) = self.store.delete(key).await {
            tracing::warn!(key, error = %e, "failed to delete discarded batch");
        }
    }

    fn skip(&self, report: &mut ReplayReport) {
        report.skipped += 1;
        self.metrics.offline_updates_skipped.inc();
    }
}

/// `key` is `{prefix}{batchID}` with a single batch id segment
///
/// Keeps `offline_location_queue:a:` from claiming the batches of user `a:b`.
fn is_batch_key(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|batch_id| !batch_id.is_empty() && !batch_id.contains(':'))
}
