//! Geographically sharded cache backed by the DHT router.
//!
//! Two local tables: permanent facts (infrastructure, cell towers) that are
//! always kept, and transient items that are kept only when the router says
//! this node owns their shard. Regions with little local data are filled in
//! on demand from the peers closest to the region's shard key.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::client::PeerClient;
use crate::geohash::{self, PRECISION_LOCAL, PRECISION_REGION};
use crate::router::DhtRouter;
use crate::types::*;

/// Below this many local results a region query also asks the network
const SPARSE_REGION: usize = 10;
/// Peers asked per region query
const QUERY_FANOUT: usize = 3;
/// Concurrent replication calls per store
const REPLICATION_CONCURRENCY: usize = 8;

/// Transport used to reach other nodes' shard endpoints
#[async_trait]
pub trait ShardNetwork: Send + Sync + 'static {
    /// Ask `address` to store a copy. `Ok(true)` means it accepted.
    async fn store(&self, address: &str, item: &ShardedData, timeout: Duration) -> anyhow::Result<bool>;

    async fn query(
        &self,
        address: &str,
        prefix: &str,
        data_type: Option<DataType>,
        timeout: Duration,
    ) -> anyhow::Result<Vec<ShardedData>>;
}

/// `ShardNetwork` over the nodes' HTTP API
#[derive(Clone)]
pub struct HttpShardNetwork {
    client: PeerClient,
}

impl HttpShardNetwork {
    pub fn new(client: PeerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ShardNetwork for HttpShardNetwork {
    async fn store(&self, address: &str, item: &ShardedData, timeout: Duration) -> anyhow::Result<bool> {
        Ok(self.client.store_shard(address, item, timeout).await?.accepted)
    }

    async fn query(
        &self,
        address: &str,
        prefix: &str,
        data_type: Option<DataType>,
        timeout: Duration,
    ) -> anyhow::Result<Vec<ShardedData>> {
        self.client.query_shards(address, prefix, data_type, timeout).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StorageStats {
    pub local_items: usize,
    pub infrastructure_items: usize,
    pub shards_responsible: usize,
    pub shards_viewing: usize,
    pub my_geohash: Option<String>,
    pub peer_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReplicationReport {
    pub stored_locally: bool,
    pub remote: DeliveryReport,
}

impl ReplicationReport {
    /// Local copy plus remote acknowledgements
    pub fn copies(&self) -> usize {
        self.stored_locally as usize + self.remote.accepted()
    }
}

#[derive(Default)]
struct Tables {
    local: HashMap<String, ShardedData>,
    infrastructure: HashMap<String, ShardedData>,
    responsibilities: BTreeMap<String, ShardResponsibility>,
    viewed: BTreeSet<String>,
    my_geohash: Option<String>,
}

impl Tables {
    fn matching<'a>(
        items: impl Iterator<Item = &'a ShardedData>,
        prefix: &'a str,
        data_type: Option<DataType>,
    ) -> impl Iterator<Item = &'a ShardedData> {
        items.filter(move |d| {
            d.geohash.starts_with(prefix) && data_type.map_or(true, |t| d.data_type() == t)
        })
    }
}

pub struct ShardedStorage<N: ShardNetwork = HttpShardNetwork> {
    node_id: NodeId,
    router: DhtRouter,
    network: N,
    tables: RwLock<Tables>,
    peers: RwLock<Vec<PeerAddr>>,
    store_timeout: Duration,
    query_timeout: Duration,
}

impl<N: ShardNetwork> ShardedStorage<N> {
    pub fn new(node_id: impl Into<NodeId>, network: N) -> Self {
        let node_id = node_id.into();
        Self {
            router: DhtRouter::new(node_id.clone()),
            node_id,
            network,
            tables: RwLock::new(Tables::default()),
            peers: RwLock::new(Vec::new()),
            store_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(mut self, store: Duration, query: Duration) -> Self {
        self.store_timeout = store;
        self.query_timeout = query;
        self
    }

    pub fn router(&self) -> &DhtRouter {
        &self.router
    }

    /// Claim the shards around a location: every data type for our own
    /// region, permanent facts only for the eight regions around it.
    pub async fn set_location(&self, lat: f64, lon: f64) -> String {
        let local = geohash::encode(lat, lon, PRECISION_LOCAL);
        let region: String = local.chars().take(PRECISION_REGION).collect();

        let mut tables = self.tables.write().await;
        tables.my_geohash = Some(local.clone());
        tables.responsibilities.insert(
            region.clone(),
            ShardResponsibility {
                geohash_prefix: region.clone(),
                data_types: DataType::ALL.to_vec(),
            },
        );
        // region is always valid base32 since we just encoded it
        for neighbor in geohash::neighbors(&region).unwrap_or_default() {
            tables.responsibilities.entry(neighbor.clone()).or_insert(ShardResponsibility {
                geohash_prefix: neighbor,
                data_types: vec![DataType::Infrastructure, DataType::CellTower],
            });
        }
        tracing::debug!(geohash = %local, shards = tables.responsibilities.len(), "Shard responsibility updated");
        local
    }

    pub async fn responsibilities(&self) -> Vec<ShardResponsibility> {
        self.tables.read().await.responsibilities.values().cloned().collect()
    }

    /// Replace the routing view of the swarm (self excluded by the caller)
    pub async fn update_peers(&self, peers: Vec<PeerAddr>) {
        *self.peers.write().await = peers;
    }

    /// Keep an item locally if it is permanent or if this node owns its shard.
    pub async fn store(&self, item: ShardedData) -> bool {
        if item.is_permanent || item.data_type().is_permanent_kind() {
            let mut tables = self.tables.write().await;
            tables.infrastructure.insert(item.data_id.clone(), item);
            return true;
        }
        if item.is_expired() {
            return false;
        }

        let total_nodes = self.peers.read().await.len() + 1;
        if !self.router.should_store(&item.shard_key(), total_nodes, item.replication_factor) {
            return false;
        }
        let mut tables = self.tables.write().await;
        tables.local.insert(item.data_id.clone(), item);
        true
    }

    /// Store locally, then push copies to the closest peers for the item's
    /// shard key. Remote failures are reported, never raised.
    pub async fn store_and_replicate(&self, item: ShardedData) -> ReplicationReport {
        let stored_locally = self.store(item.clone()).await;

        let peers = self.peers.read().await.clone();
        let targets: Vec<PeerAddr> = self
            .router
            .closest_nodes(&item.shard_key(), &peers, item.replication_factor)
            .into_iter()
            .filter(|p| p.peer_id != self.node_id)
            .collect();

        let timeout = self.store_timeout;
        let outcomes = stream::iter(targets)
            .map(|peer| {
                let item = &item;
                async move {
                    let outcome = match tokio::time::timeout(timeout, self.network.store(&peer.address, item, timeout)).await {
                        Ok(Ok(true)) => Delivery::Accepted,
                        Ok(Ok(false)) => Delivery::Rejected,
                        Ok(Err(e)) => {
                            tracing::debug!(peer = %peer.peer_id, error = %e, "Replication failed");
                            Delivery::Failed(e.to_string())
                        }
                        Err(_) => Delivery::TimedOut,
                    };
                    (peer.peer_id, outcome)
                }
            })
            .buffer_unordered(REPLICATION_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let report = ReplicationReport {
            stored_locally,
            remote: DeliveryReport { outcomes },
        };
        tracing::debug!(
            data_id = %item.data_id,
            copies = report.copies(),
            failed = report.remote.failed(),
            "Replicated shard item"
        );
        report
    }

    /// Permanent cache first, then the transient cache. Expired entries are
    /// evicted on the way.
    pub async fn get(&self, data_id: &str) -> Option<ShardedData> {
        {
            let tables = self.tables.read().await;
            if let Some(item) = tables.infrastructure.get(data_id) {
                return Some(item.clone());
            }
            match tables.local.get(data_id) {
                None => return None,
                Some(item) if !item.is_expired() => return Some(item.clone()),
                Some(_) => {}
            }
        }
        self.tables.write().await.local.remove(data_id);
        None
    }

    /// All items under a geohash prefix. When local data is sparse and
    /// peers are known, the closest peers for the region are asked too and
    /// anything new is cached.
    pub async fn get_by_geohash(&self, prefix: &str, data_type: Option<DataType>) -> Vec<ShardedData> {
        self.tables.write().await.viewed.insert(prefix.to_string());
        let mut results = self.local_by_geohash(prefix, data_type).await;

        let have_peers = !self.peers.read().await.is_empty();
        if results.len() < SPARSE_REGION && have_peers {
            let fetched = self.fetch_from_network(prefix, data_type).await;
            for item in fetched {
                // a peer may answer with anything; only keep what matches
                let matches = item.geohash.starts_with(prefix)
                    && data_type.map_or(true, |t| item.data_type() == t);
                if !matches || item.is_expired() || results.iter().any(|r| r.data_id == item.data_id) {
                    continue;
                }
                self.store(item.clone()).await;
                results.push(item);
            }
        }
        results
    }

    /// Local items under a prefix, never touching the network. Peers'
    /// shard queries are answered from here.
    pub async fn local_by_geohash(&self, prefix: &str, data_type: Option<DataType>) -> Vec<ShardedData> {
        let mut tables = self.tables.write().await;
        tables.local.retain(|_, d| !d.is_expired());

        let mut results: Vec<ShardedData> =
            Tables::matching(tables.local.values(), prefix, data_type).cloned().collect();
        let mut seen: BTreeSet<String> = results.iter().map(|d| d.data_id.clone()).collect();
        for item in Tables::matching(tables.infrastructure.values(), prefix, data_type) {
            if seen.insert(item.data_id.clone()) {
                results.push(item.clone());
            }
        }
        results
    }

    async fn fetch_from_network(&self, prefix: &str, data_type: Option<DataType>) -> Vec<ShardedData> {
        let shard_key = format!("{prefix}:{}", data_type.map_or("all", |t| t.as_str()));
        let peers = self.peers.read().await.clone();
        let targets = self.router.closest_nodes(&shard_key, &peers, QUERY_FANOUT);

        for peer in targets {
            if peer.peer_id == self.node_id {
                continue;
            }
            let call = self.network.query(&peer.address, prefix, data_type, self.query_timeout);
            match tokio::time::timeout(self.query_timeout, call).await {
                Ok(Ok(items)) if !items.is_empty() => {
                    tracing::debug!(peer = %peer.peer_id, prefix, count = items.len(), "Fetched region from peer");
                    return items;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(peer = %peer.peer_id, error = %e, "Region query failed"),
                Err(_) => tracing::debug!(peer = %peer.peer_id, "Region query timed out"),
            }
        }
        Vec::new()
    }

    pub async fn all_infrastructure(&self) -> Vec<ShardedData> {
        self.tables.read().await.infrastructure.values().cloned().collect()
    }

    /// Drop expired transient items. Permanent facts are untouched.
    pub async fn cleanup_expired(&self) -> usize {
        let mut tables = self.tables.write().await;
        let before = tables.local.len();
        tables.local.retain(|_, d| !d.is_expired());
        before - tables.local.len()
    }

    pub async fn stats(&self) -> StorageStats {
        let tables = self.tables.read().await;
        StorageStats {
            local_items: tables.local.len(),
            infrastructure_items: tables.infrastructure.len(),
            shards_responsible: tables.responsibilities.len(),
            shards_viewing: tables.viewed.len(),
            my_geohash: tables.my_geohash.clone(),
            peer_count: self.peers.read().await.len(),
        }
    }
}
