//! Realtime Server Example
//!
//! Runs the trip realtime core with in-memory backends and a few HTTP
//! routes around it:
//! - WebSocket trip chat and notification sockets
//! - Location updates and member locations
//! - Offline location batches and their replay
//! - A rate-limited login route
//! - `/health` and `/metrics`
//!
//! ```sh
//! RUST_LOG=debug cargo run --example realtime_server
//! websocat "ws://127.0.0.1:8080/trips/trip-1/ws?token=alice-token"
//! ```

use axum::extract::{Json, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use trip_realtime::prelude::*;

const TRIP_ID: &str = "trip-1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RealtimeConfig::from_env();
    let addr = config.listen_addr().to_string();

    // Seed a trip with three members
    let members = InMemoryMembershipStore::new();
    members.set_role(TRIP_ID, "alice", MemberRole::Owner);
    members.set_role(TRIP_ID, "bob", MemberRole::Member);
    members.set_role(TRIP_ID, "carol", MemberRole::Viewer);

    let tokens = StaticTokenValidator::new()
        .with_token("alice-token", "alice")
        .with_token("bob-token", "bob")
        .with_token("carol-token", "carol");

    let (host, sockets) = RealtimeBuilder::new()
        .with_config(config)
        .with_membership_store(members)
        .with_token_validator(tokens)
        .build_with_host()?;

    let auth_policy = RateLimitPolicy::auth(
        host.rate_limiter.clone(),
        host.config.rate_limit.auth_requests_per_window,
        host.config.rate_limit.window,
    );
    let auth_routes = Router::new()
        .route("/auth/login", post(login))
        .layer(axum::middleware::from_fn_with_state(auth_policy, rate_limit_middleware));

    let api = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/trips/{trip_id}/locations", get(member_locations))
        .route("/locations", post(update_location))
        .route("/locations/offline", post(save_offline))
        .route("/locations/offline/replay", post(replay_offline))
        .with_state(host.clone());

    let app = sockets
        .merge(api)
        .merge(auth_routes)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("\n🌐 Server running on http://{}", addr);
    println!("\n  🔌 WebSocket:");
    println!("    GET  /trips/{{trip_id}}/ws?token=...     - Trip chat and typing");
    println!("    GET  /ws/notifications?token=...      - Personal notifications");
    println!("\n  📍 Locations (Authorization: Bearer <token>):");
    println!("    POST /locations                        - Live location update");
    println!("    GET  /trips/{{trip_id}}/locations        - Latest member locations");
    println!("    POST /locations/offline                - Save an offline batch");
    println!("    POST /locations/offline/replay         - Replay offline batches");
    println!("\n  🔑 Tokens: alice-token (owner), bob-token (member), carol-token (viewer)");

    let draining = host.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        trip_realtime::server::shutdown_signal().await;
        let report = draining.shutdown_gracefully().await;
        tracing::info!(drained = report.drained, forced = report.forced, "sessions closed");
    })
    .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn caller(host: &RealtimeHost, headers: &HeaderMap) -> Result<String, RealtimeError> {
    let token = extract_bearer_token(headers, None)
        .ok_or_else(|| RealtimeError::auth_failed("missing bearer token"))?;
    host.token_validator.validate(&token).await
}

async fn login() -> impl IntoResponse {
    Json(serde_json::json!({ "token": "alice-token" }))
}

async fn health(State(host): State<Arc<RealtimeHost>>) -> Response {
    let report = host.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn metrics(State(host): State<Arc<RealtimeHost>>) -> Json<MetricsSnapshot> {
    Json(host.metrics.snapshot())
}

async fn update_location(
    State(host): State<Arc<RealtimeHost>>,
    headers: HeaderMap,
    Json(update): Json<LocationUpdate>,
) -> Result<Json<LatestLocation>, RealtimeError> {
    let user_id = caller(&host, &headers).await?;
    host.authorizer
        .check_role(&update.trip_id, &user_id, MemberRole::Member)
        .await?;
    let stored = host.locations.update_location(&user_id, &update).await?;
    Ok(Json(stored))
}

async fn member_locations(
    State(host): State<Arc<RealtimeHost>>,
    Path(trip_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<MemberLocation>>, RealtimeError> {
    let user_id = caller(&host, &headers).await?;
    let locations = host
        .locations
        .get_trip_member_locations(&trip_id, &user_id)
        .await?;
    Ok(Json(locations))
}

#[derive(Deserialize)]
struct OfflineRequest {
    #[serde(rename = "deviceID")]
    device_id: String,
    updates: Vec<LocationUpdate>,
}

async fn save_offline(
    State(host): State<Arc<RealtimeHost>>,
    headers: HeaderMap,
    Json(request): Json<OfflineRequest>,
) -> Result<Response, RealtimeError> {
    let user_id = caller(&host, &headers).await?;
    let batch_id = host
        .offline_queue
        .save_offline_locations(&user_id, request.updates, &request.device_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "batchID": batch_id })),
    )
        .into_response())
}

async fn replay_offline(
    State(host): State<Arc<RealtimeHost>>,
    headers: HeaderMap,
) -> Result<Json<ReplayReport>, RealtimeError> {
    let user_id = caller(&host, &headers).await?;
    let report = host.offline_queue.process_offline_locations(&user_id).await?;
    Ok(Json(report))
}
