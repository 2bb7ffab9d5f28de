mod common;

use common::*;
use geomesh_node::NodeConfig;
use geomesh_protocol::*;

fn with_dir(peer_id: &str, dir: &std::path::Path) -> NodeConfig {
    NodeConfig { data_dir: Some(dir.to_path_buf()), ..config(peer_id, true) }
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (node, _) = start(with_dir("keeper", dir.path())).await;
    let trace = node.submit_trace(Some("other"), trace_result("203.0.113.10")).await;
    node.state().mobile.register(Some("Pixel".into()), "keeper").await;
    node.update_leaderboard(LeaderboardEntry {
        peer_id: "keeper".into(),
        display_name: "Keeper".into(),
        contribution_score: 3.5,
        traceroute_count: 1,
        uptime_seconds: 5,
    })
    .await;
    node.state()
        .accept_announcement(&PeerAnnouncement {
            peer_id: "neighbour".into(),
            host: "127.0.0.1".into(),
            port: 1,
            display_name: String::new(),
            location: None,
            protocol_version: PROTOCOL_VERSION.into(),
            contribution_proof: None,
            stats: NodeStats::default(),
            last_seen: chrono::Utc::now(),
        })
        .await;
    node.stop().await;

    for file in ["peers.json", "traces.json", "topology.json", "leaderboard.json", "mobile_tokens.json"] {
        assert!(dir.path().join(file).exists(), "{file} missing");
    }

    let (revived, _) = start(with_dir("keeper", dir.path())).await;
    let traces = revived.shared_traces().await;
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].traceroute_id, trace.traceroute_id);

    let topo = revived.topology().await;
    assert_eq!(topo.links.len(), 1);
    assert_eq!((topo.links[0].source.as_str(), topo.links[0].target.as_str()), ("keeper", "other"));

    assert_eq!(revived.leaderboard().await[0].contribution_score, 3.5);
    assert_eq!(revived.mobile_devices().await[0].device_name, "Pixel");
    assert!(revived.peers().await.iter().any(|p| p.peer_id == "neighbour"));
    assert_eq!(revived.peers_with_decay().await.len(), 1);

    revived.stop().await;
}

#[tokio::test]
async fn corrupt_snapshots_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("traces.json"), "{ not json").unwrap();
    std::fs::write(dir.path().join("leaderboard.json"), "[]").unwrap();

    let (node, _) = start(with_dir("fresh", dir.path())).await;
    assert!(node.shared_traces().await.is_empty());
    assert!(node.leaderboard().await.is_empty());
    node.stop().await;
}
