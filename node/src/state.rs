use chrono::Utc;
use geomesh_protocol::geohash::{self, PRECISION_LOCAL};
use geomesh_protocol::peer::MergeOutcome;
use geomesh_protocol::proof::{self, Contribution};
use geomesh_protocol::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};

use crate::collab::HopEnricher;
use crate::config::NodeConfig;
use crate::live::LiveHub;
use crate::mobile::MobileRegistry;

/// Things the host application may want to react to
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerDiscovered(PeerInfo),
    PeerLost(NodeId),
    TraceReceived(SharedTrace),
    TopologyUpdated,
}

/// A trace held by this node. `shared` is false for traces captured while
/// sharing was off; those never leave the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace: SharedTrace,
    pub shared: bool,
}

/// 16 hex chars
pub(crate) fn new_trace_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Where a trace came from decides how far it travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOrigin {
    /// Produced here, by a phone bridged here, or handed to us directly
    Local,
    /// Pushed by a peer's broadcast
    Relayed,
    /// Pulled during a full sync
    Synced,
}

pub struct NodeState {
    pub config: NodeConfig,
    pub client: PeerClient,
    pub peers: PeerRegistry,
    pub storage: ShardedStorage,
    pub mobile: MobileRegistry,
    pub live: LiveHub,
    pub(crate) departed: RwLock<HashMap<NodeId, PeerInfo>>,
    pub(crate) decay: RwLock<NodeDecayManager>,
    pub(crate) traces: RwLock<HashMap<String, TraceRecord>>,
    pub(crate) links: RwLock<Vec<TopologyLink>>,
    pub(crate) leaderboard: RwLock<Vec<LeaderboardEntry>>,
    pub(crate) bootstrap: RwLock<Vec<String>>,
    stats: RwLock<NodeStats>,
    location: RwLock<Option<GeoPoint>>,
    viewed: RwLock<HashSet<String>>,
    sharing: AtomicBool,
    port: AtomicU16,
    started: Instant,
    events: broadcast::Sender<NodeEvent>,
    enricher: Arc<dyn HopEnricher>,
}

impl NodeState {
    pub fn new(config: NodeConfig, enricher: Arc<dyn HopEnricher>) -> Arc<Self> {
        let client = PeerClient::new(config.http_timeout);
        let storage = ShardedStorage::new(config.peer_id.clone(), HttpShardNetwork::new(client.clone()))
            .with_timeouts(config.http_timeout, config.shard_query_timeout);
        let (events, _) = broadcast::channel(128);

        Arc::new(Self {
            peers: PeerRegistry::new(config.peer_id.clone(), config.peer_timeout_secs, config.max_peers),
            mobile: MobileRegistry::new(config.mobile_token_lifetime),
            live: LiveHub::default(),
            departed: RwLock::new(HashMap::new()),
            decay: RwLock::new(NodeDecayManager::new()),
            traces: RwLock::new(HashMap::new()),
            links: RwLock::new(Vec::new()),
            leaderboard: RwLock::new(Vec::new()),
            bootstrap: RwLock::new(Vec::new()),
            stats: RwLock::new(NodeStats::default()),
            location: RwLock::new(config.location),
            viewed: RwLock::new(HashSet::new()),
            sharing: AtomicBool::new(config.share_data),
            port: AtomicU16::new(config.port),
            started: Instant::now(),
            events,
            enricher,
            client,
            storage,
            config,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub(crate) fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.port())
    }

    pub fn sharing_enabled(&self) -> bool {
        self.sharing.load(Ordering::Relaxed)
    }

    pub fn set_sharing_enabled(&self, enabled: bool) {
        self.sharing.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "Data sharing toggled");
    }

    pub fn enricher(&self) -> &Arc<dyn HopEnricher> {
        &self.enricher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Identity & proof
    // -----------------------------------------------------------------------

    pub async fn my_stats(&self) -> NodeStats {
        let mut stats = self.stats.read().await.clone();
        stats.uptime_seconds = self.started.elapsed().as_secs();
        stats
    }

    pub(crate) async fn refresh_uptime(&self) {
        self.stats.write().await.uptime_seconds = self.started.elapsed().as_secs();
    }

    pub async fn contribution_proof(&self) -> String {
        let stats = self.my_stats().await;
        let contribution = Contribution {
            traceroutes: stats.traceroute_count,
            uptime_secs: stats.uptime_seconds,
        };
        proof::generate(self.peer_id(), &contribution)
    }

    /// Missing or unverifiable proofs simply do not count
    pub fn is_contributing(&self, proof: Option<&str>) -> bool {
        proof.is_some_and(|p| proof::is_contributing(p, self.config.min_contribution))
    }

    pub async fn location(&self) -> Option<GeoPoint> {
        *self.location.read().await
    }

    pub async fn my_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: self.config.peer_id.clone(),
            host: self.config.host.clone(),
            port: self.port(),
            display_name: self.config.display_name.clone(),
            location: self.location().await,
            protocol_version: PROTOCOL_VERSION.to_string(),
            contribution_proof: Some(self.contribution_proof().await),
            stats: self.my_stats().await,
            last_seen: Utc::now(),
        }
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub(crate) async fn note_contact(&self, peer_id: &str) {
        self.decay.write().await.update_node(peer_id, false);
        self.departed.write().await.remove(peer_id);
    }

    async fn on_new_peer(&self, peer_id: &str) {
        self.stats.write().await.peers_discovered += 1;
        if let Some(peer) = self.peers.get(peer_id).await {
            self.emit(NodeEvent::PeerDiscovered(peer));
        }
    }

    /// A peer announced itself directly. Its proof is trusted only if it
    /// verifies as contributing.
    pub async fn accept_announcement(&self, ann: &PeerAnnouncement) -> MergeOutcome {
        let verified = self.is_contributing(ann.contribution_proof.as_deref());
        let outcome = self.peers.merge_peer(ann, verified).await;
        if outcome != MergeOutcome::Ignored {
            self.note_contact(&ann.peer_id).await;
        }
        if outcome == MergeOutcome::New {
            self.on_new_peer(&ann.peer_id).await;
            self.refresh_routing().await;
        }
        outcome
    }

    /// Merge a list relayed by another peer. Returns how many were new.
    pub(crate) async fn merge_relayed(&self, announcements: &[PeerAnnouncement]) -> usize {
        let discovered = self.peers.merge_peers(announcements).await;
        for peer in &discovered {
            self.note_contact(&peer.peer_id).await;
            self.on_new_peer(&peer.peer_id).await;
        }
        if !discovered.is_empty() {
            self.refresh_routing().await;
        }
        discovered.len()
    }

    pub(crate) async fn refresh_routing(&self) {
        self.storage.update_peers(self.peers.addresses().await).await;
    }

    /// Evict stale peers into the departed set, drop departed peers that
    /// have faded out. Returns the evicted ids.
    pub(crate) async fn evict_stale(&self) -> Vec<NodeId> {
        let removed = self.peers.prune_stale().await;
        let ids: Vec<NodeId> = removed.iter().map(|p| p.peer_id.clone()).collect();
        {
            let mut departed = self.departed.write().await;
            for peer in removed {
                departed.insert(peer.peer_id.clone(), peer);
            }
        }
        for id in &ids {
            self.emit(NodeEvent::PeerLost(id.clone()));
        }

        let visible: HashSet<String> = self.decay.write().await.visible_nodes().into_iter().map(|(id, _)| id).collect();
        self.departed.write().await.retain(|id, _| visible.contains(id));

        if !ids.is_empty() {
            self.refresh_routing().await;
        }
        ids
    }

    /// Active peers plus recently departed ones that have not faded yet
    pub async fn peers_with_decay(&self) -> Vec<(PeerInfo, f64)> {
        let alive = self.peers.alive_peers().await;
        let visible: HashMap<String, f64> = self.decay.write().await.visible_nodes().into_iter().collect();
        let mut departed = self.departed.write().await;
        departed.retain(|id, _| visible.contains_key(id));

        alive
            .into_iter()
            .chain(departed.values().cloned())
            .filter_map(|peer| visible.get(&peer.peer_id).map(|f| (peer, *f)))
            .collect()
    }

    pub async fn mark_infrastructure_peer(&self, peer_id: &str) {
        self.decay.write().await.mark_infrastructure(peer_id);
    }

    // -----------------------------------------------------------------------
    // Topology & leaderboard
    // -----------------------------------------------------------------------

    /// Add links not seen before, keyed by (source, target)
    pub async fn merge_links(&self, incoming: Vec<TopologyLink>) -> usize {
        let mut links = self.links.write().await;
        let mut known: HashSet<(NodeId, NodeId)> =
            links.iter().map(|l| (l.source.clone(), l.target.clone())).collect();
        let mut added = 0;
        for link in incoming {
            if known.insert((link.source.clone(), link.target.clone())) {
                links.push(link);
                added += 1;
            }
        }
        drop(links);
        if added > 0 {
            self.emit(NodeEvent::TopologyUpdated);
        }
        added
    }

    pub async fn topology(&self) -> Topology {
        Topology {
            peers: self.peers.announcements().await,
            links: self.links.read().await.clone(),
        }
    }

    /// Replace the entry for its peer, keep the best N by score
    pub async fn update_leaderboard_entry(&self, entry: LeaderboardEntry) {
        if entry.peer_id.is_empty() {
            return;
        }
        let mut board = self.leaderboard.write().await;
        board.retain(|e| e.peer_id != entry.peer_id);
        board.push(entry);
        board.sort_by(|a, b| b.contribution_score.total_cmp(&a.contribution_score));
        board.truncate(self.config.leaderboard_size);
    }

    pub async fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        self.leaderboard.read().await.clone()
    }

    /// Topology link and counters for a trace this node took part in
    pub(crate) async fn record_trace_link(
        &self,
        source: &str,
        target: Option<&str>,
        result: &TraceResult,
    ) -> Option<TopologyLink> {
        let link = TopologyLink {
            source: source.to_string(),
            target: target?.to_string(),
            latency_ms: result.total_time_ms,
            hop_count: result.hops.len(),
            hops: result.hops.clone(),
            timestamp: Utc::now(),
        };
        self.merge_links(vec![link.clone()]).await;
        Some(link)
    }

    pub(crate) async fn count_own_trace(&self, hops: usize) {
        let mut stats = self.stats.write().await;
        stats.traceroute_count += 1;
        stats.total_hops += hops as u64;
    }

    // -----------------------------------------------------------------------
    // Traces
    // -----------------------------------------------------------------------

    /// Store a trace and spread it as far as its origin allows. Returns
    /// false when the trace was already known.
    pub(crate) async fn ingest_trace(self: &Arc<Self>, trace: SharedTrace, origin: TraceOrigin) -> bool {
        let shared = match origin {
            TraceOrigin::Local => self.sharing_enabled(),
            TraceOrigin::Relayed | TraceOrigin::Synced => true,
        };

        let is_new = {
            let mut traces = self.traces.write().await;
            let is_new = !traces.contains_key(&trace.traceroute_id);
            if is_new || origin != TraceOrigin::Synced {
                traces.insert(trace.traceroute_id.clone(), TraceRecord { trace: trace.clone(), shared });
            }
            is_new
        };
        if !is_new && origin == TraceOrigin::Synced {
            return false;
        }

        let items = self.shard_items(&trace);
        if shared && origin == TraceOrigin::Local {
            let state = Arc::clone(self);
            tokio::spawn(async move {
                for item in items {
                    state.storage.store_and_replicate(item).await;
                }
            });
        } else {
            for item in items {
                self.storage.store(item).await;
            }
        }

        self.emit(NodeEvent::TraceReceived(trace.clone()));
        if shared && origin != TraceOrigin::Synced {
            self.live.publish(LiveEvent::Traceroute { data: trace.clone() });
        }
        if shared && origin == TraceOrigin::Local {
            crate::gossip::spawn_broadcast(Arc::clone(self), trace);
        }
        is_new
    }

    /// Shard items derived from a trace: the first located hop places the
    /// trace itself, every located infrastructure hop becomes a permanent fact.
    fn shard_items(&self, trace: &SharedTrace) -> Vec<ShardedData> {
        let mut items = Vec::new();

        if let Some((hop, geo)) = trace.first_located_hop() {
            let cell = geohash::encode(geo.latitude, geo.longitude, PRECISION_LOCAL);
            let entry = TraceHop {
                traceroute_id: trace.traceroute_id.clone(),
                source_peer_id: trace.source_peer_id.clone(),
                hop: hop.clone(),
            };
            let payload = if trace.is_mobile {
                ShardPayload::MobileTrace(entry)
            } else {
                ShardPayload::Traceroute(entry)
            };
            let id = format!("tr_{}_{}", trace.traceroute_id, hop.hop_number);
            items.push(ShardedData::transient(id, cell, payload, self.peer_id()));
        }

        for hop in &trace.hops {
            let (Some(ip), Some(geo)) = (hop.ip.as_ref(), hop.geo) else { continue };
            let Some(kind) = self.enricher.classify(hop) else { continue };
            let fact = InfrastructureFact {
                ip: ip.clone(),
                hostname: hop.hostname.clone(),
                kind,
                location: geo,
                asn: hop.asn.clone(),
            };
            let payload = match kind {
                InfrastructureKind::CellTower => ShardPayload::CellTower(fact),
                _ => ShardPayload::Infrastructure(fact),
            };
            let cell = geohash::encode(geo.latitude, geo.longitude, PRECISION_LOCAL);
            items.push(ShardedData::permanent(format!("infra_{ip}"), cell, payload, self.peer_id()));
        }
        items
    }

    /// Drop traces past the maximum age
    pub async fn purge_old_traces(&self) -> usize {
        let max_age = chrono::Duration::from_std(self.config.trace_max_age).unwrap_or(chrono::Duration::days(1));
        let mut traces = self.traces.write().await;
        let before = traces.len();
        traces.retain(|_, r| !r.trace.is_older_than(max_age));
        before - traces.len()
    }

    /// Every trace this node holds, local-only ones included
    pub async fn shared_traces(&self) -> Vec<SharedTrace> {
        self.purge_old_traces().await;
        let mut all: Vec<SharedTrace> = self.traces.read().await.values().map(|r| r.trace.clone()).collect();
        all.sort_by_key(|t| t.timestamp);
        all
    }

    /// What other nodes may see. Nothing while sharing is off.
    pub async fn shareable_traces(&self) -> Vec<SharedTrace> {
        if !self.sharing_enabled() {
            return Vec::new();
        }
        self.purge_old_traces().await;
        let mut out: Vec<SharedTrace> = self.traces
            .read()
            .await
            .values()
            .filter(|r| r.shared)
            .map(|r| r.trace.clone())
            .collect();
        out.sort_by_key(|t| t.timestamp);
        out
    }

    pub async fn has_trace(&self, traceroute_id: &str) -> bool {
        self.traces.read().await.contains_key(traceroute_id)
    }

    /// Latest `limit` traces from one source, oldest first
    pub async fn traces_from(&self, source_peer_id: &str, limit: usize) -> Vec<SharedTrace> {
        let mut from: Vec<SharedTrace> = self.traces
            .read()
            .await
            .values()
            .filter(|r| r.trace.source_peer_id == source_peer_id)
            .map(|r| r.trace.clone())
            .collect();
        from.sort_by_key(|t| t.timestamp);
        let skip = from.len().saturating_sub(limit);
        from.split_off(skip)
    }

    /// One entry per responding IP across every trace held
    pub async fn all_hops(&self) -> Vec<Hop> {
        let traces = self.traces.read().await;
        let mut seen = HashSet::new();
        let mut hops = Vec::new();
        for record in traces.values() {
            for hop in &record.trace.hops {
                if let Some(ip) = &hop.ip {
                    if seen.insert(ip.clone()) {
                        hops.push(hop.clone());
                    }
                }
            }
        }
        hops
    }

    // -----------------------------------------------------------------------
    // Geography
    // -----------------------------------------------------------------------

    pub async fn set_location(&self, lat: f64, lon: f64) -> String {
        *self.location.write().await = Some(GeoPoint { latitude: lat, longitude: lon });
        let cell = self.storage.set_location(lat, lon).await;
        tracing::debug!(lat, lon, geohash = %cell, "Location set");
        self.publish_location().await;
        cell
    }

    /// Keep our own location item in the shard store. Replicated only
    /// while sharing.
    pub(crate) async fn publish_location(&self) {
        let Some(location) = self.location().await else { return };
        let cell = geohash::encode(location.latitude, location.longitude, PRECISION_LOCAL);
        let item = ShardedData::transient(
            format!("peer_{}", self.peer_id()),
            cell,
            ShardPayload::Peer(PeerLocation {
                peer_id: self.config.peer_id.clone(),
                display_name: self.config.display_name.clone(),
                location,
            }),
            self.peer_id(),
        )
        .with_ttl(self.config.peer_location_ttl_secs);

        if self.sharing_enabled() {
            self.storage.store_and_replicate(item).await;
        } else {
            self.storage.store(item).await;
        }
    }

    /// Mark a region as viewed. Returns the geohash when it was not viewed before.
    pub(crate) async fn view_region(&self, lat: f64, lon: f64, zoom: u8) -> Option<String> {
        let cell = geohash::encode(lat, lon, geohash::precision_for_zoom(zoom));
        self.viewed.write().await.insert(cell.clone()).then_some(cell)
    }

    /// Load traces and infrastructure for a region and push them to live
    /// clients. Does nothing while sharing is off.
    pub async fn load_region(&self, cell: &str) -> Option<LiveEvent> {
        if !self.sharing_enabled() {
            return None;
        }
        let traceroutes = self.storage.get_by_geohash(cell, Some(DataType::Traceroute)).await;
        let infrastructure = self.storage.get_by_geohash(cell, Some(DataType::Infrastructure)).await;
        tracing::debug!(
            geohash = %cell,
            traceroutes = traceroutes.len(),
            infrastructure = infrastructure.len(),
            "Loaded region"
        );
        let event = LiveEvent::RegionData { geohash: cell.to_string(), traceroutes, infrastructure };
        self.live.publish(event.clone());
        Some(event)
    }

    pub async fn region(&self, lat: f64, lon: f64, zoom: u8) -> RegionResponse {
        let cell = geohash::encode(lat, lon, geohash::precision_for_zoom(zoom));
        let traceroutes = self.storage.get_by_geohash(&cell, Some(DataType::Traceroute)).await;
        let infrastructure = self.storage.get_by_geohash(&cell, Some(DataType::Infrastructure)).await;
        let cell_towers = self.storage.get_by_geohash(&cell, Some(DataType::CellTower)).await;
        let peer_locations = self.storage.get_by_geohash(&cell, Some(DataType::Peer)).await;
        let peers = self
            .peers_with_decay()
            .await
            .into_iter()
            .map(|(peer, decay)| DecayedPeer { peer: peer.to_announcement(), decay })
            .collect();

        RegionResponse { geohash: cell, traceroutes, infrastructure, cell_towers, peer_locations, peers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::PassthroughEnricher;
    use chrono::Duration;

    fn state(share: bool) -> Arc<NodeState> {
        let config = NodeConfig {
            peer_id: "home".into(),
            display_name: "Home".into(),
            share_data: share,
            ..NodeConfig::default()
        };
        NodeState::new(config, Arc::new(PassthroughEnricher))
    }

    fn located_hop(n: u32, ip: &str, lat: f64, lon: f64) -> Hop {
        let mut hop = Hop::new(n, Some(ip), Some(n as f64));
        hop.geo = Some(GeoPoint { latitude: lat, longitude: lon });
        hop
    }

    fn trace(id: &str, hops: Vec<Hop>) -> SharedTrace {
        SharedTrace {
            traceroute_id: id.into(),
            source_peer_id: "home".into(),
            source_display_name: None,
            target_peer_id: None,
            target_ip: "198.51.100.1".into(),
            target_display_name: None,
            timestamp: Utc::now(),
            hops,
            total_time_ms: Some(12.0),
            success: true,
            is_mobile: false,
            carrier: None,
        }
    }

    fn link(source: &str, target: &str) -> TopologyLink {
        TopologyLink {
            source: source.into(),
            target: target.into(),
            latency_ms: None,
            hop_count: 0,
            hops: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn entry(id: &str, score: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            peer_id: id.into(),
            display_name: String::new(),
            contribution_score: score,
            traceroute_count: 0,
            uptime_seconds: 0,
        }
    }

    #[tokio::test]
    async fn topology_links_dedupe_by_endpoints() {
        let s = state(false);
        let mut events = s.subscribe();
        assert_eq!(s.merge_links(vec![link("a", "b"), link("a", "b"), link("b", "a")]).await, 2);
        assert_eq!(s.merge_links(vec![link("a", "b")]).await, 0);
        assert_eq!(s.topology().await.links.len(), 2);
        assert!(matches!(events.try_recv(), Ok(NodeEvent::TopologyUpdated)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn leaderboard_replaces_sorts_and_truncates() {
        let s = state(false);
        for i in 0..105 {
            s.update_leaderboard_entry(entry(&format!("p{i}"), i as f64)).await;
        }
        s.update_leaderboard_entry(entry("p0", 1000.0)).await;
        s.update_leaderboard_entry(entry("", 5000.0)).await;

        let board = s.leaderboard().await;
        assert_eq!(board.len(), 100);
        assert_eq!(board[0].peer_id, "p0");
        assert_eq!(board[1].peer_id, "p104");
        assert_eq!(board.iter().filter(|e| e.peer_id == "p0").count(), 1);
        assert!(board.windows(2).all(|w| w[0].contribution_score >= w[1].contribution_score));
    }

    #[tokio::test]
    async fn local_traces_stay_home_when_sharing_is_off() {
        let s = state(false);
        let mut live = s.live.subscribe();
        let t = trace("t1", vec![located_hop(1, "10.0.0.1", 51.5, -0.12)]);

        assert!(s.ingest_trace(t, TraceOrigin::Local).await);
        assert_eq!(s.shared_traces().await.len(), 1);
        assert!(s.shareable_traces().await.is_empty());
        assert!(live.try_recv().is_err());

        // sharded locally even without sharing
        assert!(s.storage.get("tr_t1_1").await.is_some());
    }

    #[tokio::test]
    async fn local_only_traces_stay_hidden_after_sharing_turns_on() {
        let s = state(false);
        s.ingest_trace(trace("quiet", vec![]), TraceOrigin::Local).await;
        s.set_sharing_enabled(true);
        s.ingest_trace(trace("loud", vec![]), TraceOrigin::Local).await;

        let visible: Vec<String> = s.shareable_traces().await.into_iter().map(|t| t.traceroute_id).collect();
        assert_eq!(visible, vec!["loud".to_string()]);
    }

    #[tokio::test]
    async fn relayed_trace_reaches_live_clients() {
        let s = state(true);
        let mut live = s.live.subscribe();
        assert!(s.ingest_trace(trace("r1", vec![]), TraceOrigin::Relayed).await);
        assert!(matches!(live.try_recv(), Ok(LiveEvent::Traceroute { .. })));
    }

    #[tokio::test]
    async fn synced_duplicates_are_ignored() {
        let s = state(true);
        assert!(s.ingest_trace(trace("s1", vec![]), TraceOrigin::Synced).await);
        assert!(!s.ingest_trace(trace("s1", vec![]), TraceOrigin::Synced).await);
        assert_eq!(s.shared_traces().await.len(), 1);
    }

    #[tokio::test]
    async fn infrastructure_hops_become_permanent_facts() {
        let s = state(false);
        let mut tower = located_hop(3, "100.64.0.9", 48.85, 2.35);
        tower.hostname = Some("enodeb-12.carrier.example".into());
        let t = trace("t2", vec![Hop::new(1, None, None), located_hop(2, "10.0.0.1", 48.86, 2.34), tower]);

        s.ingest_trace(t, TraceOrigin::Local).await;

        let fact = s.storage.get("infra_100.64.0.9").await.unwrap();
        assert!(fact.is_permanent);
        assert_eq!(fact.replication_factor, INFRASTRUCTURE_REPLICATION);
        assert_eq!(fact.data_type(), DataType::CellTower);
        assert!(s.storage.get("infra_10.0.0.1").await.is_none());
        assert_eq!(s.storage.get("tr_t2_2").await.unwrap().data_type(), DataType::Traceroute);
    }

    #[tokio::test]
    async fn old_traces_are_purged() {
        let s = state(true);
        let mut old = trace("old", vec![]);
        old.timestamp = Utc::now() - Duration::hours(25);
        s.ingest_trace(old, TraceOrigin::Synced).await;
        s.ingest_trace(trace("new", vec![]), TraceOrigin::Synced).await;

        assert_eq!(s.purge_old_traces().await, 1);
        assert!(s.has_trace("new").await);
    }

    #[tokio::test]
    async fn hops_dedupe_by_ip() {
        let s = state(true);
        s.ingest_trace(trace("a", vec![located_hop(1, "10.0.0.1", 1.0, 1.0), Hop::new(2, None, None)]), TraceOrigin::Synced).await;
        s.ingest_trace(trace("b", vec![located_hop(1, "10.0.0.1", 1.0, 1.0), located_hop(2, "10.0.0.2", 1.0, 1.0)]), TraceOrigin::Synced).await;

        let mut ips: Vec<String> = s.all_hops().await.into_iter().filter_map(|h| h.ip).collect();
        ips.sort();
        assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    }

    #[tokio::test]
    async fn traces_from_keeps_latest() {
        let s = state(true);
        for i in 0..12 {
            let mut t = trace(&format!("m{i}"), vec![]);
            t.source_peer_id = "mobile_1".into();
            t.timestamp = Utc::now() - Duration::minutes(60 - i);
            s.ingest_trace(t, TraceOrigin::Synced).await;
        }
        let recent = s.traces_from("mobile_1", 10).await;
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].traceroute_id, "m2");
        assert_eq!(recent[9].traceroute_id, "m11");
    }

    #[tokio::test]
    async fn announcements_from_contributors_keep_their_proof() {
        let s = state(false);
        let proof = proof::generate("other", &Contribution { traceroutes: 3, uptime_secs: 0 });
        let ann = PeerAnnouncement {
            peer_id: "other".into(),
            host: "127.0.0.1".into(),
            port: 9000,
            display_name: "Other".into(),
            location: None,
            protocol_version: PROTOCOL_VERSION.into(),
            contribution_proof: Some(proof.clone()),
            stats: NodeStats::default(),
            last_seen: Utc::now(),
        };

        assert_eq!(s.accept_announcement(&ann).await, MergeOutcome::New);
        assert_eq!(s.peers.get("other").await.unwrap().contribution_proof, Some(proof));
        assert_eq!(s.my_stats().await.peers_discovered, 1);
        assert_eq!(s.peers_with_decay().await.len(), 1);
    }

    #[tokio::test]
    async fn region_view_is_recorded_once() {
        let s = state(false);
        assert!(s.view_region(51.5, -0.12, 10).await.is_some());
        assert!(s.view_region(51.5, -0.12, 10).await.is_none());
        assert!(s.load_region("gcpv").await.is_none());
    }
}
