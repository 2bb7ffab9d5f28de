use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::geohash::PRECISION_REGION;

/// Unique node identifier
pub type NodeId = String;

pub const PROTOCOL_VERSION: &str = "1.0";

/// Shared by every instance of this software. Hashed into the rendezvous
/// info-hash and used as the proof signing key.
pub const NETWORK_ID: &str = "ham-network-homeassistant-community-map-v1";

pub const DEFAULT_TTL_SECS: u64 = 86_400;
pub const DEFAULT_REPLICATION: usize = 3;
pub const INFRASTRUCTURE_REPLICATION: usize = 5;

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Counters every node keeps about itself and gossips to others
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    #[serde(default)]
    pub uptime_seconds: u64,
    #[serde(default)]
    pub traceroute_count: u64,
    #[serde(default)]
    pub total_hops: u64,
    #[serde(default)]
    pub peers_discovered: u64,
}

/// Announcement of a peer's existence, sent on announce and in peer lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: NodeId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default = "default_version")]
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribution_proof: Option<String>,
    #[serde(default)]
    pub stats: NodeStats,
    /// When the sender last heard from this peer (its own clock for self-announcements)
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl PeerAnnouncement {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A peer id paired with the address its HTTP endpoint lives at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub peer_id: NodeId,
    pub address: String,
}

impl PeerAddr {
    pub fn new(peer_id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self { peer_id: peer_id.into(), address: address.into() }
    }
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfrastructureKind {
    CellTower,
    Datacenter,
    Ixp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsnInfo {
    pub asn: Option<u32>,
    #[serde(default)]
    pub org: Option<String>,
    /// Coarse category such as "isp", "hosting", "mobile"
    #[serde(default)]
    pub category: Option<String>,
}

/// One hop of a path trace. Everything past `rtt_ms` is filled in by enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    pub hop_number: u32,
    pub ip: Option<String>,
    pub rtt_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<AsnInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure: Option<InfrastructureKind>,
}

impl Hop {
    pub fn new(hop_number: u32, ip: Option<&str>, rtt_ms: Option<f64>) -> Self {
        Self {
            hop_number,
            ip: ip.map(str::to_string),
            rtt_ms,
            hostname: None,
            geo: None,
            asn: None,
            infrastructure: None,
        }
    }
}

/// What a trace runner hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    pub target: String,
    pub hops: Vec<Hop>,
    pub success: bool,
    pub total_time_ms: Option<f64>,
}

/// A path trace as it travels between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedTrace {
    pub traceroute_id: String,
    pub source_peer_id: NodeId,
    #[serde(default)]
    pub source_display_name: Option<String>,
    #[serde(default)]
    pub target_peer_id: Option<NodeId>,
    #[serde(default)]
    pub target_ip: String,
    #[serde(default)]
    pub target_display_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub hops: Vec<Hop>,
    #[serde(default)]
    pub total_time_ms: Option<f64>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
}

impl SharedTrace {
    pub fn is_older_than(&self, max_age: Duration) -> bool {
        Utc::now() - self.timestamp > max_age
    }

    /// First hop carrying a geolocation, used to place the trace on a shard
    pub fn first_located_hop(&self) -> Option<(&Hop, GeoPoint)> {
        self.hops.iter().find_map(|h| h.geo.map(|g| (h, g)))
    }
}

// ---------------------------------------------------------------------------
// Sharded data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Traceroute,
    Peer,
    Infrastructure,
    CellTower,
    MobileTrace,
}

impl DataType {
    pub const ALL: [DataType; 5] = [
        DataType::Traceroute,
        DataType::Peer,
        DataType::Infrastructure,
        DataType::CellTower,
        DataType::MobileTrace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Traceroute => "traceroute",
            DataType::Peer => "peer",
            DataType::Infrastructure => "infrastructure",
            DataType::CellTower => "cell_tower",
            DataType::MobileTrace => "mobile_trace",
        }
    }

    /// Permanent facts are cached unconditionally and never expire
    pub fn is_permanent_kind(&self) -> bool {
        matches!(self, DataType::Infrastructure | DataType::CellTower)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown data type {s:?}"))
    }
}

/// A located hop from some node's trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHop {
    pub traceroute_id: String,
    pub source_peer_id: NodeId,
    pub hop: Hop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLocation {
    pub peer_id: NodeId,
    #[serde(default)]
    pub display_name: String,
    pub location: GeoPoint,
}

/// A long-lived network facility observed on some path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureFact {
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    pub kind: InfrastructureKind,
    pub location: GeoPoint,
    #[serde(default)]
    pub asn: Option<AsnInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "data_type", content = "data", rename_all = "snake_case")]
pub enum ShardPayload {
    Traceroute(TraceHop),
    Peer(PeerLocation),
    Infrastructure(InfrastructureFact),
    CellTower(InfrastructureFact),
    MobileTrace(TraceHop),
}

impl ShardPayload {
    pub fn data_type(&self) -> DataType {
        match self {
            ShardPayload::Traceroute(_) => DataType::Traceroute,
            ShardPayload::Peer(_) => DataType::Peer,
            ShardPayload::Infrastructure(_) => DataType::Infrastructure,
            ShardPayload::CellTower(_) => DataType::CellTower,
            ShardPayload::MobileTrace(_) => DataType::MobileTrace,
        }
    }
}

/// One item in the geographically sharded store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedData {
    pub data_id: String,
    pub geohash: String,
    pub payload: ShardPayload,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_replication")]
    pub replication_factor: usize,
    #[serde(default)]
    pub is_permanent: bool,
    #[serde(default)]
    pub source_peer_id: NodeId,
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_replication() -> usize {
    DEFAULT_REPLICATION
}

impl ShardedData {
    /// Expiring item with the default TTL and replication
    pub fn transient(
        data_id: impl Into<String>,
        geohash: impl Into<String>,
        payload: ShardPayload,
        source_peer_id: impl Into<NodeId>,
    ) -> Self {
        Self {
            data_id: data_id.into(),
            geohash: geohash.into(),
            payload,
            timestamp: Utc::now(),
            ttl_secs: DEFAULT_TTL_SECS,
            replication_factor: DEFAULT_REPLICATION,
            is_permanent: false,
            source_peer_id: source_peer_id.into(),
        }
    }

    /// Never-expiring item replicated more widely
    pub fn permanent(
        data_id: impl Into<String>,
        geohash: impl Into<String>,
        payload: ShardPayload,
        source_peer_id: impl Into<NodeId>,
    ) -> Self {
        Self {
            is_permanent: true,
            replication_factor: INFRASTRUCTURE_REPLICATION,
            ..Self::transient(data_id, geohash, payload, source_peer_id)
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn data_type(&self) -> DataType {
        self.payload.data_type()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// A TTL reaching past the representable time range never expires
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_permanent {
            return false;
        }
        let expiry = i64::try_from(self.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl));
        expiry.is_some_and(|at| now > at)
    }

    /// `"{region prefix}:{data type}"`, or `"global:..."` for unlocated items
    pub fn shard_key(&self) -> String {
        if self.geohash.is_empty() {
            return format!("global:{}", self.data_type());
        }
        let prefix: String = self.geohash.chars().take(PRECISION_REGION).collect();
        format!("{prefix}:{}", self.data_type())
    }
}

/// Shard prefix plus the data types this node actively stores for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardResponsibility {
    pub geohash_prefix: String,
    pub data_types: Vec<DataType>,
}

// ---------------------------------------------------------------------------
// Topology & leaderboard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyLink {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub hop_count: usize,
    #[serde(default)]
    pub hops: Vec<Hop>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub peers: Vec<PeerAnnouncement>,
    pub links: Vec<TopologyLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub peer_id: NodeId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub contribution_score: f64,
    #[serde(default)]
    pub traceroute_count: u64,
    #[serde(default)]
    pub uptime_seconds: u64,
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub peer_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub peer_id: NodeId,
    pub protocol_version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceResponse {
    pub peer_id: NodeId,
    pub accepted: bool,
    pub peer_count: usize,
}

/// A response that is only filled in for contributing callers.
///
/// Untagged: the granted body must have at least one required field that
/// the denial lacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Gated<T> {
    Granted(T),
    Denied { message: String, peer_count: usize },
}

impl<T> Gated<T> {
    pub fn granted(self) -> Option<T> {
        match self {
            Gated::Granted(t) => Some(t),
            Gated::Denied { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<PeerAnnouncement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub links: Vec<TopologyLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardUpdate {
    pub entry: LeaderboardEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub leaderboard: Vec<LeaderboardEntry>,
}

/// Direct submission of a finished trace between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteSubmission {
    pub source_peer_id: NodeId,
    #[serde(default)]
    pub source_display_name: Option<String>,
    #[serde(default)]
    pub target_peer_id: Option<NodeId>,
    #[serde(default)]
    pub target_display_name: Option<String>,
    pub traceroute: TraceResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub traceroutes: Vec<SharedTrace>,
    pub peer_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub traceroute: SharedTrace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    pub fn accepted() -> Self {
        Self { accepted: true, reason: None }
    }

    pub fn rejected(reason: &str) -> Self {
        Self { accepted: false, reason: Some(reason.to_string()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStoreRequest {
    pub data: ShardedData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStoreResponse {
    pub accepted: bool,
    pub stored_locally: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardQueryResponse {
    pub items: Vec<ShardedData>,
    pub geohash: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayedPeer {
    #[serde(flatten)]
    pub peer: PeerAnnouncement,
    pub decay: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionResponse {
    pub geohash: String,
    pub traceroutes: Vec<ShardedData>,
    pub infrastructure: Vec<ShardedData>,
    pub cell_towers: Vec<ShardedData>,
    pub peer_locations: Vec<ShardedData>,
    pub peers: Vec<DecayedPeer>,
}

/// Frames pushed over the live WebSocket stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Initial {
        traceroutes: Vec<SharedTrace>,
        peers: Vec<PeerAnnouncement>,
    },
    Traceroute {
        data: SharedTrace,
    },
    RegionData {
        geohash: String,
        traceroutes: Vec<ShardedData>,
        infrastructure: Vec<ShardedData>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Mobile bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MobileRegisterRequest {
    #[serde(default)]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeServer {
    pub peer_id: NodeId,
    pub display_name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileRegisterResponse {
    pub token: String,
    pub home_server: HomeServer,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileTraceSubmission {
    #[serde(default)]
    pub target_ip: String,
    #[serde(default)]
    pub hops: Vec<Hop>,
    #[serde(default)]
    pub total_time_ms: Option<f64>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub carrier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileSubmitResponse {
    pub accepted: bool,
    pub traceroute_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeStatus {
    pub peer_id: NodeId,
    pub display_name: String,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileStatus {
    pub home_server: HomeStatus,
    pub recent_traceroutes: Vec<SharedTrace>,
    pub token_expires: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileDevice {
    pub device_name: String,
    pub peer_id: NodeId,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

/// Outcome of one outbound call in a fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    Rejected,
    TimedOut,
    Failed(String),
}

/// Per-peer outcomes of a fan-out. Individual failures never fail the call.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub outcomes: Vec<(NodeId, Delivery)>,
}

impl DeliveryReport {
    pub fn accepted(&self) -> usize {
        self.outcomes.iter().filter(|(_, d)| *d == Delivery::Accepted).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.accepted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop_item(geohash: &str) -> ShardedData {
        ShardedData::transient(
            "tr_1_2",
            geohash,
            ShardPayload::Traceroute(TraceHop {
                traceroute_id: "1".into(),
                source_peer_id: "a".into(),
                hop: Hop::new(2, Some("10.0.0.1"), Some(3.5)),
            }),
            "a",
        )
    }

    #[test]
    fn shard_key_uses_region_prefix() {
        assert_eq!(hop_item("gcpvj").shard_key(), "gcp:traceroute");
        assert_eq!(hop_item("gc").shard_key(), "gc:traceroute");
        assert_eq!(hop_item("").shard_key(), "global:traceroute");
    }

    #[test]
    fn permanent_items_never_expire() {
        let fact = InfrastructureFact {
            ip: "1.1.1.1".into(),
            hostname: None,
            kind: InfrastructureKind::Ixp,
            location: GeoPoint { latitude: 1.0, longitude: 2.0 },
            asn: None,
        };
        let mut item = ShardedData::permanent("i", "s00", ShardPayload::Infrastructure(fact), "a");
        item.timestamp = Utc::now() - Duration::days(400);
        assert!(!item.is_expired());
        assert_eq!(item.replication_factor, INFRASTRUCTURE_REPLICATION);

        let mut old = hop_item("gcp");
        old.timestamp = Utc::now() - Duration::seconds(DEFAULT_TTL_SECS as i64 + 5);
        assert!(old.is_expired());
    }

    #[test]
    fn huge_ttls_from_the_wire_do_not_overflow() {
        for ttl in [u64::MAX, i64::MAX as u64, 10_000_000_000_000, 9_223_372_036_854_776] {
            let json = serde_json::json!({
                "data_id": "tr_x_1",
                "geohash": "gcpvj",
                "payload": {
                    "data_type": "traceroute",
                    "data": { "traceroute_id": "x", "source_peer_id": "a", "hop": { "hop_number": 1, "ip": null, "rtt_ms": null } },
                },
                "timestamp": Utc::now(),
                "ttl_secs": ttl,
            });
            let item: ShardedData = serde_json::from_value(json).unwrap();
            assert!(!item.is_expired(), "ttl {ttl}");
        }

        let mut zero = hop_item("gcp").with_ttl(0);
        zero.timestamp = Utc::now() - Duration::seconds(1);
        assert!(zero.is_expired());
    }

    #[test]
    fn payload_is_tagged_by_data_type() {
        let json = serde_json::to_value(hop_item("gcp")).unwrap();
        assert_eq!(json["payload"]["data_type"], "traceroute");
        assert_eq!(json["payload"]["data"]["hop"]["ip"], "10.0.0.1");
    }

    #[test]
    fn data_type_parses_wire_names() {
        assert_eq!("cell_tower".parse::<DataType>(), Ok(DataType::CellTower));
        assert!("towers".parse::<DataType>().is_err());
    }

    #[test]
    fn gated_distinguishes_denial() {
        let denied: Gated<PeerList> =
            serde_json::from_str(r#"{"message":"Contribute to see full peer list","peer_count":4}"#).unwrap();
        assert!(matches!(denied, Gated::Denied { peer_count: 4, .. }));

        let granted: Gated<PeerList> = serde_json::from_str(r#"{"peers":[]}"#).unwrap();
        assert!(granted.granted().is_some());
    }

    #[test]
    fn announcement_tolerates_sparse_json() {
        let ann: PeerAnnouncement =
            serde_json::from_str(r#"{"peer_id":"p","host":"10.0.0.9","port":8123}"#).unwrap();
        assert_eq!(ann.address(), "10.0.0.9:8123");
        assert_eq!(ann.protocol_version, PROTOCOL_VERSION);
        assert_eq!(ann.stats, NodeStats::default());
    }
}
