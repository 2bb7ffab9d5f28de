use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

use crate::dht::{DhtClient, DhtConfig};
use crate::dns::DnsFallback;
use crate::pubsub::PubSubRelay;

pub const PUBLIC_IP_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

const VERIFY_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Dht,
    PubSub,
    Dns,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscoveryMethod::Dht => "dht",
            DiscoveryMethod::PubSub => "pubsub",
            DiscoveryMethod::Dns => "dns",
        })
    }
}

/// An unverified address produced by a discovery channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    pub peer_id: Option<String>,
    pub method: DiscoveryMethod,
}

impl Candidate {
    pub fn new(host: impl Into<String>, port: u16, method: DiscoveryMethod) -> Self {
        Self { host: host.into(), port, peer_id: None, method }
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A candidate that answered the ping handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub host: String,
    pub port: u16,
    pub peer_id: String,
    pub method: DiscoveryMethod,
    /// Last successful handshake
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredPeer {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One way of finding other nodes without a coordinating server.
#[async_trait]
pub trait DiscoveryChannel: Send + Sync {
    fn method(&self) -> DiscoveryMethod;

    /// Whether the channel can currently be used
    async fn is_active(&self) -> bool {
        true
    }

    async fn candidates(&self) -> Result<Vec<Candidate>>;

    /// Read-only channels are left out of announce rounds
    fn can_announce(&self) -> bool {
        true
    }

    async fn announce(&self, host: &str, port: u16, peer_id: &str) -> Result<()>;

    /// Release sockets and background tasks
    fn shutdown(&self) {}
}

/// Returns the remote node id when the candidate is a live node
#[async_trait]
pub trait CandidateVerifier: Send + Sync {
    async fn verify(&self, candidate: &Candidate) -> Option<String>;
}

/// Handshake over the node's own `/p2p/ping` endpoint
pub struct HttpVerifier {
    http: reqwest::Client,
    own_id: String,
    timeout: Duration,
}

impl HttpVerifier {
    pub fn new(own_id: impl Into<String>, timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), own_id: own_id.into(), timeout }
    }
}

#[async_trait]
impl CandidateVerifier for HttpVerifier {
    async fn verify(&self, candidate: &Candidate) -> Option<String> {
        let url = format!("http://{}/p2p/ping", candidate.address());
        let resp = self.http
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "peer_id": self.own_id }))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        body.get("peer_id")?.as_str().map(str::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub peer_id: String,
    /// Advertised host; resolved from public IP echo services when unset
    pub public_host: Option<String>,
    pub discovery_interval: Duration,
    pub announce_interval: Duration,
    pub verify_timeout: Duration,
    /// Verified peers older than this are pinged again and dropped if silent
    pub rediscover_after: Duration,
    pub ip_services: Vec<String>,
    pub enable_dht: bool,
    pub dht: DhtConfig,
    /// Local pub/sub daemon API; `None` disables the channel
    pub pubsub_api: Option<String>,
    pub dns_domains: Vec<String>,
}

impl DiscoveryConfig {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            public_host: None,
            discovery_interval: Duration::from_secs(300),
            announce_interval: Duration::from_secs(600),
            verify_timeout: Duration::from_secs(5),
            rediscover_after: Duration::from_secs(600),
            ip_services: PUBLIC_IP_SERVICES.iter().map(|s| s.to_string()).collect(),
            enable_dht: true,
            dht: DhtConfig::default(),
            pubsub_api: Some(crate::pubsub::DEFAULT_API.to_string()),
            dns_domains: crate::dns::DEFAULT_DOMAINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

struct Shared {
    config: DiscoveryConfig,
    channels: Vec<Arc<dyn DiscoveryChannel>>,
    verifier: Arc<dyn CandidateVerifier>,
    p2p_port: AtomicU16,
    public_host: RwLock<Option<String>>,
    discovered: RwLock<HashMap<String, DiscoveredPeer>>,
    events: broadcast::Sender<DiscoveredPeer>,
    shutdown: watch::Sender<bool>,
    http: reqwest::Client,
}

/// Runs every discovery channel on a timer and hands verified peers to
/// subscribers. Channels fail independently; a dead channel never stops
/// the others.
#[derive(Clone)]
pub struct AutoDiscovery {
    shared: Arc<Shared>,
}

impl AutoDiscovery {
    pub fn new(
        config: DiscoveryConfig,
        channels: Vec<Arc<dyn DiscoveryChannel>>,
        verifier: Arc<dyn CandidateVerifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        let public_host = config.public_host.clone();
        Self {
            shared: Arc::new(Shared {
                config,
                channels,
                verifier,
                p2p_port: AtomicU16::new(0),
                public_host: RwLock::new(public_host),
                discovered: RwLock::new(HashMap::new()),
                events,
                shutdown,
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Build with the stock channels. Each one that fails to come up is
    /// logged and left out.
    pub async fn with_default_channels(config: DiscoveryConfig) -> Self {
        let mut channels: Vec<Arc<dyn DiscoveryChannel>> = Vec::new();

        if config.enable_dht {
            match DhtClient::start(config.dht.clone()).await {
                Ok(dht) => channels.push(Arc::new(dht)),
                Err(e) => tracing::warn!(error = %e, "DHT discovery unavailable"),
            }
        }

        if let Some(api) = &config.pubsub_api {
            let relay = PubSubRelay::new(api.clone());
            if relay.start().await {
                channels.push(Arc::new(relay));
            } else {
                tracing::info!(api = %api, "Pub/sub relay not reachable, skipping");
            }
        }

        if !config.dns_domains.is_empty() {
            channels.push(Arc::new(DnsFallback::new(config.dns_domains.clone())));
        }

        let verifier = Arc::new(HttpVerifier::new(config.peer_id.clone(), config.verify_timeout));
        Self::new(config, channels, verifier)
    }

    /// The advertised port is unknown until the HTTP listener binds
    pub fn set_p2p_port(&self, port: u16) {
        self.shared.p2p_port.store(port, Ordering::Relaxed);
    }

    pub fn p2p_port(&self) -> u16 {
        self.shared.p2p_port.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveredPeer> {
        self.shared.events.subscribe()
    }

    pub fn channel_methods(&self) -> Vec<DiscoveryMethod> {
        self.shared.channels.iter().map(|c| c.method()).collect()
    }

    pub async fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.shared.discovered.read().await.values().cloned().collect()
    }

    /// `host:port` of every verified peer, usable as bootstrap seeds
    pub async fn bootstrap_addresses(&self) -> Vec<String> {
        self.shared.discovered.read().await.keys().cloned().collect()
    }

    fn own_address(&self, host: Option<&str>) -> Option<String> {
        host.map(|h| format!("{}:{}", h, self.p2p_port()))
    }

    /// Forget peers whose handshake is older than `rediscover_after`, so a
    /// node that restarts at the same address is verified and published again
    async fn forget_stale(&self) {
        let window = self.shared.config.rediscover_after;
        let now = Utc::now();
        let mut discovered = self.shared.discovered.write().await;
        let before = discovered.len();
        // a handshake stamped in the future counts as fresh
        discovered.retain(|_, p| (now - p.discovered_at).to_std().map_or(true, |age| age < window));
        let dropped = before - discovered.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Re-verifying stale discovered peers");
        }
    }

    /// Query every active channel, verify unseen candidates and publish the
    /// ones that answer. Returns the number of newly verified peers.
    pub async fn discovery_round(&self) -> usize {
        self.forget_stale().await;
        let own = self.own_address(self.shared.public_host.read().await.as_deref());
        let known: HashSet<String> = self.shared.discovered.read().await.keys().cloned().collect();

        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for channel in &self.shared.channels {
            if !channel.is_active().await {
                continue;
            }
            match channel.candidates().await {
                Ok(found) => {
                    tracing::debug!(method = %channel.method(), count = found.len(), "Discovery candidates");
                    for candidate in found {
                        let addr = candidate.address();
                        if known.contains(&addr) || own.as_deref() == Some(addr.as_str()) {
                            continue;
                        }
                        if seen.insert(addr) {
                            fresh.push(candidate);
                        }
                    }
                }
                Err(e) => tracing::warn!(method = %channel.method(), error = %e, "Discovery channel failed"),
            }
        }

        let verifier = &self.shared.verifier;
        let verified: Vec<(Candidate, Option<String>)> = stream::iter(fresh)
            .map(|candidate| async move {
                let id = verifier.verify(&candidate).await;
                (candidate, id)
            })
            .buffer_unordered(VERIFY_CONCURRENCY)
            .collect()
            .await;

        let mut added = 0;
        for (candidate, remote_id) in verified {
            let Some(peer_id) = remote_id else {
                tracing::debug!(addr = %candidate.address(), "Candidate did not answer ping");
                continue;
            };
            if peer_id == self.shared.config.peer_id {
                continue;
            }
            let peer = DiscoveredPeer {
                host: candidate.host.clone(),
                port: candidate.port,
                peer_id,
                method: candidate.method,
                discovered_at: Utc::now(),
            };
            tracing::info!(addr = %peer.address(), method = %peer.method, "🔭 Discovered peer");
            self.shared.discovered.write().await.insert(peer.address(), peer.clone());
            let _ = self.shared.events.send(peer);
            added += 1;
        }
        added
    }

    /// Ask the echo services for our public address. The first well-formed
    /// answer wins.
    pub async fn resolve_public_host(&self) -> Option<String> {
        for service in &self.shared.config.ip_services {
            let resp = self.shared.http.get(service).timeout(Duration::from_secs(5)).send().await;
            let Ok(resp) = resp else { continue };
            if !resp.status().is_success() {
                continue;
            }
            let Ok(text) = resp.text().await else { continue };
            let candidate = text.trim();
            if candidate.parse::<IpAddr>().is_ok() {
                tracing::info!(ip = %candidate, service = %service, "Resolved public address");
                return Some(candidate.to_string());
            }
        }
        None
    }

    /// Announce on every active channel. Skipped while the port is unknown
    /// or no public host can be determined. Returns the channels that took it.
    pub async fn announce_round(&self) -> usize {
        let port = self.p2p_port();
        if port == 0 {
            tracing::debug!("Skipping announce, listener port not set yet");
            return 0;
        }

        let current = self.shared.public_host.read().await.clone();
        let host = match current {
            Some(h) => h,
            None => match self.resolve_public_host().await {
                Some(h) => {
                    *self.shared.public_host.write().await = Some(h.clone());
                    h
                }
                None => {
                    tracing::warn!("No public address, skipping announce");
                    return 0;
                }
            },
        };

        let mut announced = 0;
        for channel in &self.shared.channels {
            if !channel.can_announce() || !channel.is_active().await {
                continue;
            }
            match channel.announce(&host, port, &self.shared.config.peer_id).await {
                Ok(()) => announced += 1,
                Err(e) => tracing::debug!(method = %channel.method(), error = %e, "Announce failed"),
            }
        }
        tracing::info!(host = %host, port, channels = announced, "📣 Announced presence");
        announced
    }

    /// Spawn the discovery and announce loops. They end on `stop`.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        tracing::info!(channels = ?self.channel_methods(), "Starting auto-discovery");
        let discovery = {
            let this = self.clone();
            let mut stop = self.shared.shutdown.subscribe();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(this.shared.config.discovery_interval);
                loop {
                    tokio::select! {
                        _ = timer.tick() => { this.discovery_round().await; }
                        _ = stop.changed() => break,
                    }
                }
            })
        };
        let announce = {
            let this = self.clone();
            let mut stop = self.shared.shutdown.subscribe();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(this.shared.config.announce_interval);
                loop {
                    tokio::select! {
                        _ = timer.tick() => { this.announce_round().await; }
                        _ = stop.changed() => break,
                    }
                }
            })
        };
        vec![discovery, announce]
    }

    pub fn stop(&self) {
        let _ = self.shared.shutdown.send(true);
        for channel in &self.shared.channels {
            channel.shutdown();
        }
        tracing::info!("Auto-discovery stopped");
    }
}
