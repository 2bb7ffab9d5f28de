use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::*;

/// Information about a known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: NodeId,
    pub host: String,
    pub port: u16,
    pub display_name: String,
    pub location: Option<GeoPoint>,
    pub protocol_version: String,
    pub stats: NodeStats,
    /// Only kept once it has verified as contributing
    pub contribution_proof: Option<String>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub failed_contacts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Active,
    /// Not heard from within the timeout; evicted on the next maintenance pass
    Stale,
}

impl PeerInfo {
    fn from_announcement(ann: &PeerAnnouncement, proof_verified: bool, last_seen: DateTime<Utc>) -> Self {
        Self {
            peer_id: ann.peer_id.clone(),
            host: ann.host.clone(),
            port: ann.port,
            display_name: ann.display_name.clone(),
            location: ann.location,
            protocol_version: ann.protocol_version.clone(),
            stats: ann.stats.clone(),
            contribution_proof: if proof_verified { ann.contribution_proof.clone() } else { None },
            last_seen,
            failed_contacts: 0,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_alive(&self, timeout_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.last_seen);
        age.num_seconds() < timeout_secs as i64
    }

    pub fn state(&self, timeout_secs: u64) -> PeerState {
        if self.is_alive(timeout_secs) {
            PeerState::Active
        } else {
            PeerState::Stale
        }
    }

    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.peer_id
        } else {
            &self.display_name
        }
    }

    pub fn to_addr(&self) -> PeerAddr {
        PeerAddr::new(self.peer_id.clone(), self.address())
    }

    pub fn to_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: self.peer_id.clone(),
            host: self.host.clone(),
            port: self.port,
            display_name: self.display_name.clone(),
            location: self.location,
            protocol_version: self.protocol_version.clone(),
            contribution_proof: self.contribution_proof.clone(),
            stats: self.stats.clone(),
            last_seen: self.last_seen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    New,
    Updated,
    /// Ourselves, an older write, or the table is full
    Ignored,
}

/// Thread-safe table of known peers
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<NodeId, PeerInfo>>>,
    self_id: NodeId,
    peer_timeout_secs: u64,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId, peer_timeout_secs: u64, max_peers: usize) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            self_id,
            peer_timeout_secs,
            max_peers,
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        self.peer_timeout_secs
    }

    /// Add or update a peer. The most recent write for a peer id wins;
    /// timestamps from the future are clamped to now.
    pub async fn merge_peer(&self, ann: &PeerAnnouncement, proof_verified: bool) -> MergeOutcome {
        if ann.peer_id == self.self_id {
            return MergeOutcome::Ignored;
        }
        let seen = ann.last_seen.min(Utc::now());

        let mut peers = self.peers.write().await;
        let at_capacity = peers.len() >= self.max_peers;
        match peers.get_mut(&ann.peer_id) {
            Some(entry) => {
                if seen < entry.last_seen {
                    return MergeOutcome::Ignored;
                }
                let proof = if proof_verified {
                    ann.contribution_proof.clone()
                } else {
                    entry.contribution_proof.take()
                };
                let failed = entry.failed_contacts;
                *entry = PeerInfo::from_announcement(ann, false, seen);
                entry.contribution_proof = proof;
                entry.failed_contacts = failed;
                MergeOutcome::Updated
            }
            None if at_capacity => {
                tracing::debug!(peer = %ann.peer_id, max = self.max_peers, "Peer table full, ignoring");
                MergeOutcome::Ignored
            }
            None => {
                tracing::info!(
                    peer = %ann.peer_id,
                    addr = %ann.address(),
                    "🌐 Discovered new peer"
                );
                peers.insert(ann.peer_id.clone(), PeerInfo::from_announcement(ann, proof_verified, seen));
                MergeOutcome::New
            }
        }
    }

    /// Merge a batch relayed by another peer. Relayed proofs are not trusted.
    pub async fn merge_peers(&self, announcements: &[PeerAnnouncement]) -> Vec<PeerInfo> {
        let mut discovered = Vec::new();
        for ann in announcements {
            if self.merge_peer(ann, false).await == MergeOutcome::New {
                if let Some(peer) = self.get(&ann.peer_id).await {
                    discovered.push(peer);
                }
            }
        }
        discovered
    }

    /// Mark a peer as seen (update last_seen)
    pub async fn touch(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.last_seen = Utc::now();
            peer.failed_contacts = 0;
        }
    }

    /// Record a failed contact. Eviction is left to `prune_stale`.
    pub async fn record_failure(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.failed_contacts += 1;
        }
    }

    /// Remove peers not seen within the timeout and return them
    pub async fn prune_stale(&self) -> Vec<PeerInfo> {
        let mut peers = self.peers.write().await;
        let stale: Vec<NodeId> = peers
            .values()
            .filter(|p| p.state(self.peer_timeout_secs) == PeerState::Stale)
            .map(|p| p.peer_id.clone())
            .collect();

        let removed: Vec<PeerInfo> = stale.iter().filter_map(|id| peers.remove(id)).collect();
        for peer in &removed {
            tracing::info!(peer = %peer.peer_id, name = %peer.label(), "💀 Peer went stale, removing");
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), remaining = peers.len(), "Pruned stale peers");
        }
        removed
    }

    /// Get all active peers
    pub async fn alive_peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.values()
            .filter(|p| p.is_alive(self.peer_timeout_secs))
            .cloned()
            .collect()
    }

    /// Every peer in the table, stale or not
    pub async fn all(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Get all peer announcements for gossip sync
    pub async fn announcements(&self) -> Vec<PeerAnnouncement> {
        self.alive_peers().await.iter().map(|p| p.to_announcement()).collect()
    }

    /// Active peers as routing entries
    pub async fn addresses(&self) -> Vec<PeerAddr> {
        self.alive_peers().await.iter().map(PeerInfo::to_addr).collect()
    }

    /// Pick N random alive peers for gossip fan-out
    pub async fn random_peers(&self, n: usize) -> Vec<PeerInfo> {
        use rand::seq::SliceRandom;
        let alive = self.alive_peers().await;
        if alive.len() <= n {
            return alive;
        }
        let mut rng = rand::thread_rng();
        let mut selected = alive;
        selected.shuffle(&mut rng);
        selected.truncate(n);
        selected
    }

    /// Number of known alive peers
    pub async fn count(&self) -> usize {
        self.alive_peers().await.len()
    }

    /// Get a specific peer by ID
    pub async fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().await;
        peers.get(peer_id).cloned()
    }

    /// Restore a persisted table. Entries beyond capacity are dropped.
    pub async fn restore(&self, saved: Vec<PeerInfo>) {
        let mut peers = self.peers.write().await;
        for peer in saved {
            if peer.peer_id == self.self_id || peers.len() >= self.max_peers {
                continue;
            }
            peers.insert(peer.peer_id.clone(), peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ann(id: &str, port: u16) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: id.into(),
            host: "10.0.0.2".into(),
            port,
            display_name: format!("{id} home"),
            location: None,
            protocol_version: PROTOCOL_VERSION.into(),
            contribution_proof: Some("proof".into()),
            stats: NodeStats::default(),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ignores_self_and_respects_capacity() {
        let reg = PeerRegistry::new("me".into(), 600, 2);
        assert_eq!(reg.merge_peer(&ann("me", 1), true).await, MergeOutcome::Ignored);
        assert_eq!(reg.merge_peer(&ann("a", 1), true).await, MergeOutcome::New);
        assert_eq!(reg.merge_peer(&ann("b", 1), true).await, MergeOutcome::New);
        assert_eq!(reg.merge_peer(&ann("c", 1), true).await, MergeOutcome::Ignored);
        // updates still go through at capacity
        assert_eq!(reg.merge_peer(&ann("a", 2), true).await, MergeOutcome::Updated);
        assert_eq!(reg.count().await, 2);
        assert_eq!(reg.get("a").await.unwrap().port, 2);
    }

    #[tokio::test]
    async fn older_writes_lose() {
        let reg = PeerRegistry::new("me".into(), 600, 50);
        reg.merge_peer(&ann("a", 1), false).await;

        let mut old = ann("a", 9);
        old.last_seen = Utc::now() - Duration::seconds(30);
        assert_eq!(reg.merge_peer(&old, false).await, MergeOutcome::Ignored);
        assert_eq!(reg.get("a").await.unwrap().port, 1);
    }

    #[tokio::test]
    async fn unverified_proofs_are_not_stored() {
        let reg = PeerRegistry::new("me".into(), 600, 50);
        reg.merge_peer(&ann("a", 1), false).await;
        assert!(reg.get("a").await.unwrap().contribution_proof.is_none());

        reg.merge_peer(&ann("a", 1), true).await;
        assert_eq!(reg.get("a").await.unwrap().contribution_proof.as_deref(), Some("proof"));

        // a later unverified update keeps the verified proof
        reg.merge_peer(&ann("a", 1), false).await;
        assert!(reg.get("a").await.unwrap().contribution_proof.is_some());
    }

    #[tokio::test]
    async fn stale_peers_are_pruned_and_returned() {
        let reg = PeerRegistry::new("me".into(), 600, 50);
        let mut stale = ann("old", 1);
        stale.last_seen = Utc::now() - Duration::seconds(700);
        reg.merge_peer(&stale, false).await;
        reg.merge_peer(&ann("fresh", 1), false).await;

        assert_eq!(reg.count().await, 1);
        assert_eq!(reg.all().await.len(), 2);
        let removed = reg.prune_stale().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].peer_id, "old");
        assert!(reg.get("old").await.is_none());
    }

    #[tokio::test]
    async fn failures_do_not_evict() {
        let reg = PeerRegistry::new("me".into(), 600, 50);
        reg.merge_peer(&ann("a", 1), false).await;
        for _ in 0..5 {
            reg.record_failure("a").await;
        }
        assert_eq!(reg.get("a").await.unwrap().failed_contacts, 5);
        assert!(reg.prune_stale().await.is_empty());
        reg.touch("a").await;
        assert_eq!(reg.get("a").await.unwrap().failed_contacts, 0);
    }

    #[tokio::test]
    async fn relayed_batches_report_new_peers() {
        let reg = PeerRegistry::new("me".into(), 600, 50);
        reg.merge_peer(&ann("a", 1), false).await;
        let discovered = reg.merge_peers(&[ann("a", 1), ann("b", 1), ann("me", 1)]).await;
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].peer_id, "b");
        assert_eq!(reg.random_peers(5).await.len(), 2);
        assert_eq!(reg.random_peers(1).await.len(), 1);
    }
}
