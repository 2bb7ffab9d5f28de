//! Minimal mainline DHT client used purely as a rendezvous point.
//!
//! Every instance derives the same `info_hash` from the network id, so a
//! `get_peers` for it returns other instances that announced themselves.
//! Only the client side is spoken (ping, get_peers, announce_peer); incoming
//! queries are ignored. Every failure degrades to an empty result.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch, Mutex, RwLock};

use crate::bencode::{self, Value};
use crate::discovery::{Candidate, DiscoveryChannel, DiscoveryMethod};

pub use geomesh_protocol::NETWORK_ID;

pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
    "dht.aelitis.com:6881",
];

const COMPACT_NODE_LEN: usize = 26;
const COMPACT_PEER_LEN: usize = 6;
const MAX_KNOWN_NODES: usize = 512;
const MAX_PEERS_FOUND: usize = 256;

/// Peers collected by one get_peers lookup
type PeerSink = Arc<Mutex<Vec<SocketAddr>>>;

pub type InfoHash = [u8; 20];

/// SHA-1 of the shared network identifier
pub fn info_hash(network_id: &str) -> InfoHash {
    Sha1::digest(network_id.as_bytes()).into()
}

#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Local UDP bind address; port 0 picks a free one
    pub bind: SocketAddr,
    /// `host:port` entries resolved at start
    pub bootstrap: Vec<String>,
    pub info_hash: InfoHash,
    pub query_timeout: Duration,
    /// Wait after a get_peers round for late answers
    pub settle_time: Duration,
    pub get_peers_sample: usize,
    pub announce_sample: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            bootstrap: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            info_hash: info_hash(NETWORK_ID),
            query_timeout: Duration::from_secs(5),
            settle_time: Duration::from_secs(3),
            get_peers_sample: 10,
            announce_sample: 8,
        }
    }
}

struct Inner {
    socket: UdpSocket,
    node_id: [u8; 20],
    config: DhtConfig,
    next_tid: AtomicU16,
    pending: Mutex<HashMap<[u8; 2], oneshot::Sender<Value>>>,
    known_nodes: RwLock<Vec<SocketAddr>>,
    /// Transaction id to the lookup that sent it; outlives `pending` so
    /// answers arriving during the settle time still land
    lookups: Mutex<HashMap<[u8; 2], PeerSink>>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DhtClient {
    inner: Arc<Inner>,
}

impl DhtClient {
    /// Bind the socket, start the listener and ping the bootstrap nodes.
    /// Only a bind failure is an error.
    pub async fn start(config: DhtConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind).await.context("Failed to bind DHT socket")?;
        let mut node_id = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut node_id);
        let (shutdown, _) = watch::channel(false);

        let client = Self {
            inner: Arc::new(Inner {
                socket,
                node_id,
                config,
                next_tid: AtomicU16::new(0),
                pending: Mutex::new(HashMap::new()),
                known_nodes: RwLock::new(Vec::new()),
                lookups: Mutex::new(HashMap::new()),
                shutdown,
            }),
        };

        let listener = client.clone();
        let mut stop = client.inner.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = listener.listen() => {}
                _ = stop.changed() => {}
            }
            tracing::debug!("DHT listener stopped");
        });

        client.bootstrap().await;
        tracing::info!(
            port = client.local_port(),
            info_hash = %hex::encode(client.inner.config.info_hash),
            known_nodes = client.known_node_count().await,
            "DHT client started"
        );
        Ok(client)
    }

    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    pub fn local_port(&self) -> u16 {
        self.inner.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.inner.config.info_hash
    }

    pub async fn known_node_count(&self) -> usize {
        self.inner.known_nodes.read().await.len()
    }

    async fn bootstrap(&self) {
        let mut resolved = Vec::new();
        for host in &self.inner.config.bootstrap {
            match tokio::net::lookup_host(host.as_str()).await {
                Ok(addrs) => resolved.extend(addrs.filter(SocketAddr::is_ipv4)),
                Err(e) => tracing::debug!(host = %host, error = %e, "Bootstrap host did not resolve"),
            }
        }
        self.remember_nodes(resolved.iter().copied()).await;

        let pings = resolved.iter().map(|addr| self.ping(*addr));
        let answered = join_all(pings).await.into_iter().filter(|ok| *ok).count();
        tracing::debug!(answered, asked = resolved.len(), "DHT bootstrap pings done");
    }

    async fn remember_nodes(&self, nodes: impl Iterator<Item = SocketAddr>) {
        let mut known = self.inner.known_nodes.write().await;
        for node in nodes {
            if known.len() >= MAX_KNOWN_NODES {
                break;
            }
            if !known.contains(&node) {
                known.push(node);
            }
        }
    }

    async fn listen(&self) {
        let mut buf = vec![0u8; 4096];
        loop {
            match self.inner.socket.recv_from(&mut buf).await {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                Err(e) => {
                    tracing::debug!(error = %e, "DHT receive error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let msg = match bencode::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(from = %from, error = %e, "Dropping malformed DHT message");
                return;
            }
        };

        let kind = msg.get(b"y").and_then(Value::as_bytes);
        if !matches!(kind, Some(b"r") | Some(b"e")) {
            return;
        }

        let tid = msg.get(b"t").and_then(Value::as_bytes).and_then(|t| <[u8; 2]>::try_from(t).ok());

        if let Some(Value::Dict(body)) = msg.get(b"r") {
            if let Some(nodes) = body.get(b"nodes".as_slice()).and_then(Value::as_bytes) {
                self.remember_nodes(parse_compact_nodes(nodes).into_iter()).await;
            }
            if let Some(values) = body.get(b"values".as_slice()).and_then(Value::as_list) {
                let sink = match tid {
                    Some(tid) => self.inner.lookups.lock().await.get(&tid).cloned(),
                    None => None,
                };
                if let Some(sink) = sink {
                    let mut found = sink.lock().await;
                    for peer in parse_compact_peers(values) {
                        if found.len() < MAX_PEERS_FOUND && !found.contains(&peer) {
                            tracing::info!(peer = %peer, "DHT found peer");
                            found.push(peer);
                        }
                    }
                }
            }
        }

        let Some(tid) = tid else { return };
        if let Some(waiter) = self.inner.pending.lock().await.remove(&tid) {
            let _ = waiter.send(msg);
        }
    }

    fn next_tid(&self) -> [u8; 2] {
        self.inner.next_tid.fetch_add(1, Ordering::Relaxed).wrapping_add(1).to_be_bytes()
    }

    /// Send one query and wait for its matching response. `None` on timeout,
    /// send failure or an error reply.
    async fn query(&self, to: SocketAddr, method: &str, args: BTreeMap<Vec<u8>, Value>) -> Option<Value> {
        self.query_as(self.next_tid(), to, method, args).await
    }

    async fn query_as(
        &self,
        tid: [u8; 2],
        to: SocketAddr,
        method: &str,
        mut args: BTreeMap<Vec<u8>, Value>,
    ) -> Option<Value> {
        args.insert(b"id".to_vec(), Value::bytes(self.inner.node_id));
        let msg = Value::dict([
            ("t", Value::bytes(tid)),
            ("y", Value::from("q")),
            ("q", Value::from(method)),
            ("a", Value::Dict(args)),
        ]);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(tid, tx);

        let result = async {
            self.inner.socket.send_to(&bencode::encode(&msg), to).await.ok()?;
            tokio::time::timeout(self.inner.config.query_timeout, rx).await.ok()?.ok()
        }
        .await;
        self.inner.pending.lock().await.remove(&tid);

        match result {
            Some(reply) if matches!(reply.get(b"y").and_then(Value::as_bytes), Some(b"r")) => Some(reply),
            Some(_) => {
                tracing::debug!(node = %to, method, "DHT node returned an error");
                None
            }
            None => None,
        }
    }

    async fn ping(&self, node: SocketAddr) -> bool {
        self.query(node, "ping", BTreeMap::new()).await.is_some()
    }

    fn get_peers_args(info_hash: &InfoHash) -> BTreeMap<Vec<u8>, Value> {
        BTreeMap::from([(b"info_hash".to_vec(), Value::bytes(info_hash))])
    }

    async fn sample_nodes(&self, n: usize) -> Vec<SocketAddr> {
        let known = self.inner.known_nodes.read().await;
        known.choose_multiple(&mut rand::thread_rng(), n).copied().collect()
    }

    /// Ask a random sample of known nodes for peers under `info_hash`,
    /// wait for late answers, and return every peer address seen. Lookups
    /// running side by side keep separate results.
    pub async fn get_peers(&self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        let found: PeerSink = Arc::default();
        let nodes = self.sample_nodes(self.inner.config.get_peers_sample).await;
        let tids: Vec<[u8; 2]> = nodes.iter().map(|_| self.next_tid()).collect();
        {
            let mut lookups = self.inner.lookups.lock().await;
            for tid in &tids {
                lookups.insert(*tid, Arc::clone(&found));
            }
        }

        let queries = nodes
            .iter()
            .zip(&tids)
            .map(|(n, tid)| self.query_as(*tid, *n, "get_peers", Self::get_peers_args(info_hash)));
        join_all(queries).await;
        tokio::time::sleep(self.inner.config.settle_time).await;

        {
            let mut lookups = self.inner.lookups.lock().await;
            for tid in &tids {
                lookups.remove(tid);
            }
        }
        let peers = found.lock().await.clone();
        peers
    }

    /// Two-phase announce against a sample of nodes: get_peers for a token,
    /// then announce_peer. Returns how many nodes acknowledged.
    pub async fn announce_peer(&self, info_hash: &InfoHash, port: u16) -> usize {
        let nodes = self.sample_nodes(self.inner.config.announce_sample).await;
        let announces = nodes.iter().map(|node| async move {
            let reply = self.query(*node, "get_peers", Self::get_peers_args(info_hash)).await?;
            let token = reply.get(b"r")?.get(b"token")?.as_bytes()?.to_vec();
            let args = BTreeMap::from([
                (b"info_hash".to_vec(), Value::bytes(info_hash)),
                (b"port".to_vec(), Value::Int(port as i64)),
                (b"token".to_vec(), Value::Bytes(token)),
                (b"implied_port".to_vec(), Value::Int(0)),
            ]);
            self.query(*node, "announce_peer", args).await
        });
        let acked = join_all(announces).await.into_iter().flatten().count();
        tracing::debug!(acked, asked = nodes.len(), port, "DHT announce done");
        acked
    }
}

#[async_trait]
impl DiscoveryChannel for DhtClient {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Dht
    }

    async fn candidates(&self) -> Result<Vec<Candidate>> {
        let peers = self.get_peers(&self.info_hash()).await;
        Ok(peers
            .into_iter()
            .map(|addr| Candidate::new(addr.ip().to_string(), addr.port(), DiscoveryMethod::Dht))
            .collect())
    }

    /// The DHT records the sender's source address; only the port is sent
    async fn announce(&self, _host: &str, port: u16, _peer_id: &str) -> Result<()> {
        let acked = self.announce_peer(&self.info_hash(), port).await;
        if acked == 0 {
            anyhow::bail!("no DHT node accepted the announce");
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.stop();
    }
}

fn compact_v4(bytes: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

/// 20-byte node id followed by a 6-byte IPv4 endpoint, repeated
pub fn parse_compact_nodes(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| compact_v4(&chunk[20..]))
        .filter(|addr| addr.port() != 0)
        .collect()
}

/// Each entry is a 6-byte IPv4 endpoint; shorter entries are skipped
pub fn parse_compact_peers(values: &[Value]) -> Vec<SocketAddr> {
    values
        .iter()
        .filter_map(Value::as_bytes)
        .filter(|b| b.len() >= COMPACT_PEER_LEN)
        .map(compact_v4)
        .collect()
}
