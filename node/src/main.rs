use anyhow::Result;
use clap::Parser;
use geomesh_node::{NodeConfig, P2pNode};
use geomesh_protocol::GeoPoint;
use geomesh_rendezvous::{AutoDiscovery, DiscoveryConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geomesh-node", about = "geomesh peer: gossip membership and geo-sharded trace storage")]
struct Cli {
    /// Port to listen on (0 picks a free one)
    #[arg(long, default_value = "0", env = "GEOMESH_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "GEOMESH_BIND")]
    bind: String,

    /// Host other nodes should use to reach us
    #[arg(long, default_value = "127.0.0.1", env = "GEOMESH_HOST")]
    host: String,

    /// Stable node id (random when omitted)
    #[arg(long, env = "GEOMESH_PEER_ID")]
    peer_id: Option<String>,

    #[arg(long, default_value = "", env = "GEOMESH_NAME")]
    name: String,

    /// Share traces with the mesh
    #[arg(long, env = "GEOMESH_SHARE")]
    share: bool,

    #[arg(long, env = "GEOMESH_LAT", requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,

    #[arg(long, env = "GEOMESH_LON", requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,

    /// Comma-separated host:port list to bootstrap from
    #[arg(long, env = "GEOMESH_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Data directory for persistence
    #[arg(long, env = "GEOMESH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Skip DHT, pub/sub and DNS discovery
    #[arg(long, env = "GEOMESH_NO_DISCOVERY")]
    no_discovery: bool,

    /// Publicly reachable host to announce (looked up when omitted)
    #[arg(long, env = "GEOMESH_PUBLIC_HOST")]
    public_host: Option<String>,

    #[arg(long, env = "GEOMESH_NO_DHT")]
    no_dht: bool,

    /// Local pub/sub daemon API, "" to disable
    #[arg(long, env = "GEOMESH_PUBSUB_API")]
    pubsub_api: Option<String>,

    /// DNS names carrying bootstrap TXT records
    #[arg(long, env = "GEOMESH_DNS_DOMAINS", value_delimiter = ',')]
    dns_domain: Vec<String>,
}

impl Cli {
    fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig {
            display_name: self.name.clone(),
            host: self.host.clone(),
            bind_host: self.bind.clone(),
            port: self.port,
            share_data: self.share,
            location: self.lat.zip(self.lon).map(|(latitude, longitude)| GeoPoint { latitude, longitude }),
            bootstrap_peers: self.bootstrap.clone(),
            data_dir: self.data_dir.clone(),
            ..NodeConfig::default()
        };
        if let Some(id) = &self.peer_id {
            config.peer_id = id.clone();
        }
        config
    }

    fn discovery_config(&self, peer_id: &str) -> DiscoveryConfig {
        let mut config = DiscoveryConfig::new(peer_id);
        config.public_host = self.public_host.clone();
        config.enable_dht = !self.no_dht;
        if let Some(api) = &self.pubsub_api {
            config.pubsub_api = Some(api.clone()).filter(|a| !a.is_empty());
        }
        if !self.dns_domain.is_empty() {
            config.dns_domains = self.dns_domain.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let node = Arc::new(P2pNode::new(cli.node_config()));
    tracing::info!(peer_id = %node.peer_id(), share = cli.share, "Starting geomesh node");

    let addr = node.start().await?;
    tracing::info!("Listening on {addr}");

    let discovery = if cli.no_discovery {
        None
    } else {
        let discovery = AutoDiscovery::with_default_channels(cli.discovery_config(node.peer_id())).await;
        discovery.set_p2p_port(addr.port());

        let mut found = discovery.subscribe();
        let bridge = Arc::clone(&node);
        tokio::spawn(async move {
            loop {
                match found.recv().await {
                    Ok(peer) => {
                        bridge.add_bootstrap_peer(&peer.address()).await;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let _loops = discovery.start();
        Some(discovery)
    };

    shutdown_signal().await;

    if let Some(discovery) = discovery {
        discovery.stop();
    }
    node.stop().await;
    tracing::info!("Node shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
