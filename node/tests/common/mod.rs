#![allow(dead_code)]

use geomesh_node::{NodeConfig, P2pNode};
use geomesh_protocol::proof::{self, Contribution};
use geomesh_protocol::{GeoPoint, Hop, TraceResult};
use std::time::Duration;

const IDLE: Duration = Duration::from_secs(3600);

/// Loopback config with every loop parked so tests drive rounds by hand
pub fn config(peer_id: &str, share: bool) -> NodeConfig {
    NodeConfig {
        peer_id: peer_id.into(),
        display_name: format!("node {peer_id}"),
        host: "127.0.0.1".into(),
        bind_host: "127.0.0.1".into(),
        share_data: share,
        gossip_interval: IDLE,
        maintenance_interval: IDLE,
        stats_interval: IDLE,
        sync_delay: IDLE,
        sync_interval: IDLE,
        http_timeout: Duration::from_secs(2),
        bootstrap_timeout: Duration::from_secs(2),
        ..NodeConfig::default()
    }
}

pub async fn start(config: NodeConfig) -> (P2pNode, String) {
    let node = P2pNode::new(config);
    let addr = node.start().await.unwrap();
    (node, addr.to_string())
}

pub async fn started(peer_id: &str, share: bool) -> (P2pNode, String) {
    start(config(peer_id, share)).await
}

pub fn located(n: u32, ip: &str, lat: f64, lon: f64) -> Hop {
    let mut hop = Hop::new(n, Some(ip), Some(n as f64 * 1.5));
    hop.geo = Some(GeoPoint { latitude: lat, longitude: lon });
    hop
}

pub fn trace_result(target: &str) -> TraceResult {
    TraceResult {
        target: target.into(),
        hops: vec![
            located(1, "10.0.0.1", 51.50, -0.12),
            Hop::new(2, None, None),
            located(3, "198.51.100.7", 52.37, 4.90),
        ],
        success: true,
        total_time_ms: Some(21.5),
    }
}

/// Proof for a made-up caller with the given trace count
pub fn proof_with(traceroutes: u64) -> String {
    proof::generate("outsider", &Contribution { traceroutes, uptime_secs: 60 })
}

/// Poll until `check` passes or a few seconds go by
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
