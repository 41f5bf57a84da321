//! Offline location replay through a fully wired host

#![cfg(feature = "in-memory")]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use trip_realtime::prelude::*;

const TRIP: &str = "trip-1";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn update(trip_id: &str, minutes_ago: i64, latitude: f64) -> LocationUpdate {
    LocationUpdate {
        trip_id: trip_id.to_string(),
        latitude,
        longitude: 13.4,
        accuracy: 5.0,
        timestamp: (now() - chrono::Duration::minutes(minutes_ago)).timestamp_millis(),
    }
}

struct Fixture {
    host: RealtimeHost,
    kv: InMemoryKeyValue,
    locations: InMemoryLocationStore,
    members: InMemoryMembershipStore,
}

fn fixture() -> Fixture {
    let kv = InMemoryKeyValue::new();
    let locations = InMemoryLocationStore::new();
    let members = InMemoryMembershipStore::new();
    members.set_role(TRIP, "u1", MemberRole::Member);

    let host = RealtimeBuilder::new()
        .with_key_value(kv.clone())
        .with_location_store(locations.clone())
        .with_membership_store(members.clone())
        .with_clock(ManualClock::new(now()))
        .with_token_validator(StaticTokenValidator::new())
        .build_host()
        .unwrap();

    Fixture {
        host,
        kv,
        locations,
        members,
    }
}

async fn location_events(host: &RealtimeHost) -> Subscription {
    host.event_bus
        .subscribe(
            CancellationToken::new(),
            Channel::trip(TRIP),
            "observer",
            [EventType::LocationUpdated],
        )
        .await
        .unwrap()
}

async fn next_event(subscription: &mut Subscription) -> Event {
    timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Subscription ended")
}

fn client_time(event: &Event) -> DateTime<Utc> {
    serde_json::from_value(event.payload["timestampClient"].clone()).unwrap()
}

#[tokio::test]
async fn test_replays_batches_in_timestamp_order() {
    let f = fixture();
    let mut events = location_events(&f.host).await;
    let queue = &f.host.offline_queue;

    // Saved newest first; replay must still be oldest first
    for (minutes_ago, latitude) in [(30, 52.3), (60, 52.2), (180, 52.1)] {
        queue
            .save_offline_locations("u1", vec![update(TRIP, minutes_ago, latitude)], "phone")
            .await
            .unwrap()
            .unwrap();
    }

    let report = queue.process_offline_locations("u1").await.unwrap();
    assert_eq!(
        report,
        ReplayReport {
            lock_acquired: true,
            batches: 3,
            discarded_batches: 0,
            replayed: 3,
            skipped: 0,
        }
    );

    let mut previous = None;
    for expected in [52.1, 52.2, 52.3] {
        let event = next_event(&mut events).await;
        assert_eq!(event.event_type, EventType::LocationUpdated);
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.payload["latitude"], expected);

        let at = client_time(&event);
        assert!(previous.is_none_or(|p| p <= at));
        previous = Some(at);
    }

    // Batches and lease are gone
    assert!(f.kv.keys("offline_location_queue:u1:*").await.unwrap().is_empty());
    assert_eq!(f.kv.get("offline_location_lock:u1").await.unwrap(), None);

    let latest = f.locations.latest(TRIP, "u1").unwrap();
    assert_eq!(latest.latitude, 52.3);
    assert_eq!(f.host.metrics.snapshot().offline_updates_replayed_total, 3);
}

#[tokio::test]
async fn test_replay_skips_trips_without_membership() {
    let f = fixture();
    f.members.set_role("trip-2", "u1", MemberRole::Viewer);
    let queue = &f.host.offline_queue;

    queue
        .save_offline_locations(
            "u1",
            vec![
                update(TRIP, 10, 1.0),
                update("trip-2", 9, 2.0),
                update("trip-3", 8, 3.0),
            ],
            "phone",
        )
        .await
        .unwrap();

    let report = queue.process_offline_locations("u1").await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.skipped, 2);
    assert!(f.locations.latest("trip-2", "u1").is_none());
    assert!(f.locations.latest("trip-3", "u1").is_none());
}

#[tokio::test]
async fn test_replay_skips_invalid_and_stale_updates() {
    let f = fixture();
    let queue = &f.host.offline_queue;

    queue
        .save_offline_locations(
            "u1",
            vec![
                update(TRIP, 25 * 60, 1.0),
                update(TRIP, 20, 91.0),
                update(TRIP, 15, 48.8),
            ],
            "phone",
        )
        .await
        .unwrap();

    let report = queue.process_offline_locations("u1").await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(f.locations.latest(TRIP, "u1").unwrap().latitude, 48.8);
    assert_eq!(f.host.metrics.snapshot().offline_updates_skipped_total, 2);
}

#[tokio::test]
async fn test_replay_is_skipped_while_lease_is_held() {
    let f = fixture();
    let queue = &f.host.offline_queue;
    queue
        .save_offline_locations("u1", vec![update(TRIP, 5, 1.0)], "phone")
        .await
        .unwrap();

    f.kv.set_nx_ex("offline_location_lock:u1", "other-worker", Duration::from_secs(300))
        .await
        .unwrap();

    let report = queue.process_offline_locations("u1").await.unwrap();
    assert_eq!(report, ReplayReport::default());
    assert_eq!(f.kv.keys("offline_location_queue:u1:*").await.unwrap().len(), 1);

    // The foreign lease is left alone
    assert_eq!(
        f.kv.get("offline_location_lock:u1").await.unwrap().as_deref(),
        Some("other-worker")
    );
}

#[tokio::test]
async fn test_concurrent_replays_apply_each_batch_once() {
    let f = fixture();
    let host = Arc::new(f.host);
    let mut events = location_events(&host).await;

    for minutes_ago in [3, 2, 1] {
        host.offline_queue
            .save_offline_locations("u1", vec![update(TRIP, minutes_ago, 10.0)], "phone")
            .await
            .unwrap();
    }

    let a = {
        let host = host.clone();
        tokio::spawn(async move { host.offline_queue.process_offline_locations("u1").await })
    };
    let b = {
        let host = host.clone();
        tokio::spawn(async move { host.offline_queue.process_offline_locations("u1").await })
    };
    let reports = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

    let replayed: usize = reports.iter().map(|r| r.replayed).sum();
    assert!(reports.iter().any(|r| r.lock_acquired));
    assert!(replayed <= 3);

    // Whatever ran, nothing is left behind for a later run to double-apply
    let leftover = host.offline_queue.process_offline_locations("u1").await.unwrap();
    assert_eq!(replayed + leftover.replayed, 3);

    for _ in 0..3 {
        next_event(&mut events).await;
    }
}

#[tokio::test]
async fn test_save_rejects_oversized_batch_and_ignores_empty() {
    let f = fixture();
    let queue = &f.host.offline_queue;

    assert_eq!(queue.save_offline_locations("u1", vec![], "phone").await.unwrap(), None);

    let oversized = vec![update(TRIP, 1, 1.0); 1001];
    let err = queue
        .save_offline_locations("u1", oversized, "phone")
        .await
        .unwrap_err();
    assert!(matches!(err, RealtimeError::Validation { .. }));
    assert!(f.kv.keys("offline_location_queue:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_save_fails_when_store_down() {
    let f = fixture();
    f.kv.set_available(false);

    let err = f
        .host
        .offline_queue
        .save_offline_locations("u1", vec![update(TRIP, 1, 1.0)], "phone")
        .await
        .unwrap_err();
    assert!(matches!(err, RealtimeError::TransportUnavailable(_)));
}
