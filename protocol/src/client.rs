use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::types::*;

pub const PROOF_HEADER: &str = "X-Contribution-Proof";

/// Node-to-node HTTP client. Every call carries a timeout; failures are
/// returned to the caller, which decides whether they matter.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(address: &str, path: &str) -> String {
        format!("http://{}{}", address.trim_end_matches('/'), path)
    }

    async fn read<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("{what}: HTTP {status}");
        }
        resp.json().await.with_context(|| format!("{what}: bad response body"))
    }

    pub async fn ping(&self, address: &str, own_id: &str) -> Result<PingResponse> {
        let body = PingRequest { peer_id: Some(own_id.to_string()) };
        let resp = self.http.post(Self::url(address, "/p2p/ping"))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("Failed to reach peer")?;
        Self::read(resp, "ping").await
    }

    pub async fn announce(&self, address: &str, me: &PeerAnnouncement, timeout: Duration) -> Result<AnnounceResponse> {
        let resp = self.http.post(Self::url(address, "/p2p/announce"))
            .timeout(timeout)
            .json(me)
            .send()
            .await
            .context("Failed to reach peer")?;
        Self::read(resp, "announce").await
    }

    pub async fn peers(&self, address: &str, proof: &str) -> Result<Gated<PeerList>> {
        let resp = self.http.get(Self::url(address, "/p2p/peers"))
            .timeout(self.timeout)
            .header(PROOF_HEADER, proof)
            .send()
            .await
            .context("Failed to request peer list")?;
        Self::read(resp, "peers").await
    }

    pub async fn topology(&self, address: &str, proof: &str) -> Result<Gated<Topology>> {
        let resp = self.http.get(Self::url(address, "/p2p/topology"))
            .timeout(self.timeout)
            .header(PROOF_HEADER, proof)
            .send()
            .await
            .context("Failed to request topology")?;
        Self::read(resp, "topology").await
    }

    pub async fn push_topology(&self, address: &str, links: Vec<TopologyLink>) -> Result<Ack> {
        let resp = self.http.post(Self::url(address, "/p2p/topology"))
            .timeout(self.timeout)
            .json(&TopologyUpdate { links })
            .send()
            .await
            .context("Failed to push topology")?;
        Self::read(resp, "topology update").await
    }

    pub async fn leaderboard(&self, address: &str) -> Result<Vec<LeaderboardEntry>> {
        let resp = self.http.get(Self::url(address, "/p2p/leaderboard"))
            .timeout(self.timeout)
            .send()
            .await
            .context("Failed to request leaderboard")?;
        let board: Leaderboard = Self::read(resp, "leaderboard").await?;
        Ok(board.leaderboard)
    }

    pub async fn push_leaderboard(&self, address: &str, entry: &LeaderboardEntry) -> Result<Ack> {
        let resp = self.http.post(Self::url(address, "/p2p/leaderboard"))
            .timeout(self.timeout)
            .json(&LeaderboardUpdate { entry: entry.clone() })
            .send()
            .await
            .context("Failed to push leaderboard entry")?;
        Self::read(resp, "leaderboard update").await
    }

    pub async fn submit_traceroute(&self, address: &str, submission: &TracerouteSubmission) -> Result<Ack> {
        let resp = self.http.post(Self::url(address, "/p2p/traceroute"))
            .timeout(self.timeout)
            .json(submission)
            .send()
            .await
            .context("Failed to submit traceroute")?;
        Self::read(resp, "traceroute").await
    }

    pub async fn full_sync(&self, address: &str, proof: &str, timeout: Duration) -> Result<Gated<SyncResponse>> {
        let resp = self.http.get(Self::url(address, "/p2p/sync"))
            .timeout(timeout)
            .header(PROOF_HEADER, proof)
            .send()
            .await
            .context("Failed to request sync")?;
        Self::read(resp, "sync").await
    }

    pub async fn broadcast(&self, address: &str, trace: &SharedTrace) -> Result<Ack> {
        let resp = self.http.post(Self::url(address, "/p2p/broadcast"))
            .timeout(self.timeout)
            .json(&BroadcastRequest { traceroute: trace.clone() })
            .send()
            .await
            .context("Failed to broadcast")?;
        Self::read(resp, "broadcast").await
    }

    pub async fn store_shard(&self, address: &str, item: &ShardedData, timeout: Duration) -> Result<ShardStoreResponse> {
        let resp = self.http.post(Self::url(address, "/p2p/shard/store"))
            .timeout(timeout)
            .json(&ShardStoreRequest { data: item.clone() })
            .send()
            .await
            .context("Failed to replicate shard")?;
        Self::read(resp, "shard store").await
    }

    pub async fn query_shards(
        &self,
        address: &str,
        prefix: &str,
        data_type: Option<DataType>,
        timeout: Duration,
    ) -> Result<Vec<ShardedData>> {
        let mut query = vec![("geohash", prefix.to_string())];
        if let Some(t) = data_type {
            query.push(("type", t.to_string()));
        }
        let resp = self.http.get(Self::url(address, "/p2p/shard/query"))
            .timeout(timeout)
            .query(&query)
            .send()
            .await
            .context("Failed to query shard")?;
        let body: ShardQueryResponse = Self::read(resp, "shard query").await?;
        Ok(body.items)
    }
}
