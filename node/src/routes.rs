use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use geomesh_protocol::client::PROOF_HEADER;
use geomesh_protocol::*;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::MobileAuthError;
use crate::live;
use crate::state::{NodeState, TraceOrigin};

pub const MOBILE_TOKEN_HEADER: &str = "X-Mobile-Token";

pub fn create_router(state: Arc<NodeState>) -> Router {
    let body_limit = state.config.body_limit;
    Router::new()
        .route("/p2p/ping", post(ping))
        .route("/p2p/announce", post(announce))
        .route("/p2p/peers", get(peers))
        .route("/p2p/topology", get(topology).post(update_topology))
        .route("/p2p/leaderboard", get(leaderboard).post(update_leaderboard))
        .route("/p2p/traceroute", post(traceroute))
        .route("/p2p/sync", get(full_sync))
        .route("/p2p/broadcast", post(broadcast))
        .route("/p2p/ws", get(live::ws_handler))
        .route("/p2p/shard/store", post(shard_store))
        .route("/p2p/shard/query", get(shard_query))
        .route("/p2p/shard/region", get(shard_region))
        .route("/api/mobile/register", post(mobile_register))
        .route("/api/mobile/traceroute", post(mobile_traceroute))
        .route("/api/mobile/status", get(mobile_status))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn check_proof(state: &NodeState, headers: &HeaderMap) -> bool {
    state.is_contributing(header(headers, PROOF_HEADER))
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

async fn ping(State(state): State<Arc<NodeState>>, Json(req): Json<PingRequest>) -> Json<PingResponse> {
    if let Some(peer_id) = req.peer_id.as_deref() {
        if state.peers.get(peer_id).await.is_some() {
            state.peers.touch(peer_id).await;
            state.note_contact(peer_id).await;
        }
    }
    Json(PingResponse {
        peer_id: state.config.peer_id.clone(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        timestamp: Utc::now(),
    })
}

async fn announce(
    State(state): State<Arc<NodeState>>,
    Json(ann): Json<PeerAnnouncement>,
) -> Result<Json<AnnounceResponse>, (StatusCode, Json<Value>)> {
    if ann.peer_id.is_empty() {
        return Err(bad_request("Missing peer_id"));
    }
    state.accept_announcement(&ann).await;
    Ok(Json(AnnounceResponse {
        peer_id: state.config.peer_id.clone(),
        accepted: true,
        peer_count: state.peers.count().await,
    }))
}

/// Active peers plus ourselves, for contributors only
async fn peers(State(state): State<Arc<NodeState>>, headers: HeaderMap) -> Json<Gated<PeerList>> {
    if !check_proof(&state, &headers) {
        return Json(Gated::Denied {
            message: "Contribute to see full peer list".into(),
            peer_count: state.peers.count().await,
        });
    }
    let mut peers = state.peers.announcements().await;
    peers.push(state.my_announcement().await);
    Json(Gated::Granted(PeerList { peers }))
}

// ---------------------------------------------------------------------------
// Topology & leaderboard
// ---------------------------------------------------------------------------

async fn topology(State(state): State<Arc<NodeState>>, headers: HeaderMap) -> Json<Gated<Topology>> {
    if !check_proof(&state, &headers) {
        return Json(Gated::Denied {
            message: "Contribute to see network topology".into(),
            peer_count: state.peers.count().await,
        });
    }
    Json(Gated::Granted(state.topology().await))
}

async fn update_topology(State(state): State<Arc<NodeState>>, Json(update): Json<TopologyUpdate>) -> Json<Ack> {
    let added = state.merge_links(update.links).await;
    tracing::debug!(added, "Topology links merged");
    Json(Ack::accepted())
}

async fn leaderboard(State(state): State<Arc<NodeState>>) -> Json<Leaderboard> {
    Json(Leaderboard { leaderboard: state.leaderboard().await })
}

async fn update_leaderboard(State(state): State<Arc<NodeState>>, Json(update): Json<LeaderboardUpdate>) -> Json<Ack> {
    state.update_leaderboard_entry(update.entry).await;
    Json(Ack::accepted())
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

/// A finished trace handed over directly by its producer
async fn traceroute(State(state): State<Arc<NodeState>>, Json(sub): Json<TracerouteSubmission>) -> Json<Ack> {
    state
        .record_trace_link(&sub.source_peer_id, sub.target_peer_id.as_deref(), &sub.traceroute)
        .await;

    if state.sharing_enabled() {
        let trace = SharedTrace {
            traceroute_id: crate::state::new_trace_id(),
            source_peer_id: sub.source_peer_id,
            source_display_name: sub.source_display_name,
            target_peer_id: sub.target_peer_id,
            target_ip: sub.traceroute.target,
            target_display_name: sub.target_display_name,
            timestamp: Utc::now(),
            hops: sub.traceroute.hops,
            total_time_ms: sub.traceroute.total_time_ms,
            success: sub.traceroute.success,
            is_mobile: false,
            carrier: None,
        };
        state.ingest_trace(trace, TraceOrigin::Local).await;
    }
    Json(Ack::accepted())
}

async fn full_sync(State(state): State<Arc<NodeState>>, headers: HeaderMap) -> Json<Gated<SyncResponse>> {
    let peer_count = state.peers.count().await;
    if !check_proof(&state, &headers) {
        return Json(Gated::Denied {
            message: "Contribute to access shared data".into(),
            peer_count,
        });
    }
    Json(Gated::Granted(SyncResponse {
        traceroutes: state.shareable_traces().await,
        peer_count,
        timestamp: Utc::now(),
    }))
}

async fn broadcast(State(state): State<Arc<NodeState>>, Json(req): Json<BroadcastRequest>) -> Json<Ack> {
    if !state.sharing_enabled() {
        return Json(Ack::rejected("sharing_disabled"));
    }
    let id = req.traceroute.traceroute_id.clone();
    if state.ingest_trace(req.traceroute, TraceOrigin::Relayed).await {
        tracing::debug!(trace = %id, "📡 Trace received via broadcast");
    }
    Json(Ack::accepted())
}

// ---------------------------------------------------------------------------
// Shards
// ---------------------------------------------------------------------------

async fn shard_store(State(state): State<Arc<NodeState>>, Json(req): Json<ShardStoreRequest>) -> Json<ShardStoreResponse> {
    let stored_locally = state.storage.store(req.data).await;
    Json(ShardStoreResponse { accepted: true, stored_locally })
}

#[derive(Debug, Deserialize)]
struct ShardQueryParams {
    #[serde(default)]
    geohash: String,
    #[serde(default, rename = "type")]
    data_type: Option<String>,
}

async fn shard_query(
    State(state): State<Arc<NodeState>>,
    Query(params): Query<ShardQueryParams>,
) -> Result<Json<ShardQueryResponse>, (StatusCode, Json<Value>)> {
    if params.geohash.is_empty() {
        return Err(bad_request("Missing geohash"));
    }
    // an unknown type means "all types"
    let data_type = params.data_type.and_then(|t| t.parse::<DataType>().ok());
    let items = state.storage.local_by_geohash(&params.geohash, data_type).await;
    Ok(Json(ShardQueryResponse {
        count: items.len(),
        geohash: params.geohash,
        items,
    }))
}

fn default_zoom() -> u8 {
    10
}

#[derive(Debug, Deserialize)]
struct RegionParams {
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
    #[serde(default = "default_zoom")]
    zoom: u8,
}

async fn shard_region(State(state): State<Arc<NodeState>>, Query(params): Query<RegionParams>) -> Json<RegionResponse> {
    Json(state.region(params.lat, params.lon, params.zoom).await)
}

// ---------------------------------------------------------------------------
// Mobile bridge
// ---------------------------------------------------------------------------

async fn mobile_register(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    Json(req): Json<MobileRegisterRequest>,
) -> Result<Json<MobileRegisterResponse>, MobileAuthError> {
    if header(&headers, "authorization").map_or(true, str::is_empty) {
        return Err(MobileAuthError::MissingAuthorization);
    }
    let (token, _) = state.mobile.register(req.device_name, state.peer_id()).await;
    Ok(Json(MobileRegisterResponse {
        token,
        home_server: HomeServer {
            peer_id: state.config.peer_id.clone(),
            display_name: state.config.display_name.clone(),
            host: state.config.host.clone(),
            port: state.port(),
        },
        expires_in: state.mobile.lifetime_secs(),
    }))
}

async fn mobile_traceroute(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    Json(sub): Json<MobileTraceSubmission>,
) -> Result<Json<MobileSubmitResponse>, MobileAuthError> {
    let device = state.mobile.authorize(header(&headers, MOBILE_TOKEN_HEADER)).await?;

    let trace = SharedTrace {
        traceroute_id: crate::state::new_trace_id(),
        source_peer_id: device.peer_id,
        source_display_name: Some(device.device_name),
        target_peer_id: Some(device.home_peer_id),
        target_ip: sub.target_ip,
        target_display_name: Some(state.config.display_name.clone()),
        timestamp: Utc::now(),
        hops: sub.hops,
        total_time_ms: sub.total_time_ms,
        success: sub.success,
        is_mobile: true,
        carrier: sub.carrier,
    };
    let traceroute_id = trace.traceroute_id.clone();
    tracing::info!(trace = %traceroute_id, source = %trace.source_peer_id, "📱 Mobile trace received");
    state.ingest_trace(trace, TraceOrigin::Local).await;

    Ok(Json(MobileSubmitResponse { accepted: true, traceroute_id }))
}

async fn mobile_status(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
) -> Result<Json<MobileStatus>, MobileAuthError> {
    let device = state.mobile.authorize(header(&headers, MOBILE_TOKEN_HEADER)).await?;
    Ok(Json(MobileStatus {
        home_server: HomeStatus {
            peer_id: state.config.peer_id.clone(),
            display_name: state.config.display_name.clone(),
            online: true,
        },
        recent_traceroutes: state.traces_from(&device.peer_id, 10).await,
        token_expires: device.expires,
    }))
}
