mod common;

use common::*;
use geomesh_node::{NodeConfig, NodeError, NodeEvent, NodeStatus, P2pNode};
use geomesh_protocol::{Gated, PeerClient};
use std::time::Duration;

#[tokio::test]
async fn sharing_nodes_converge_on_traces() {
    let (x, x_addr) = started("x", true).await;
    let (y, _y_addr) = started("y", true).await;

    let from_x = x.submit_trace(None, trace_result("203.0.113.10")).await;
    y.submit_trace(None, trace_result("203.0.113.20")).await;

    assert!(y.add_bootstrap_peer(&x_addr).await);
    assert!(y.peers().await.iter().any(|p| p.peer_id == "x"));
    assert!(x.peers().await.iter().any(|p| p.peer_id == "y"));

    assert_eq!(x.gossip_round().await, 1);
    assert!(y.sync_round().await >= 1);

    let ids: Vec<String> = y.shared_traces().await.into_iter().map(|t| t.traceroute_id).collect();
    assert!(ids.contains(&from_x.traceroute_id));

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn private_node_gives_nothing_away() {
    let (x, x_addr) = started("x", false).await;
    let secret = x.submit_trace(None, trace_result("203.0.113.10")).await;
    assert_eq!(x.shared_traces().await.len(), 1);

    let client = PeerClient::new(Duration::from_secs(2));
    let sync = client.full_sync(&x_addr, &proof_with(5), Duration::from_secs(2)).await.unwrap();
    match sync {
        Gated::Granted(resp) => assert!(resp.traceroutes.is_empty()),
        Gated::Denied { .. } => panic!("contributing caller was refused"),
    }

    let ack = client.broadcast(&x_addr, &secret).await.unwrap();
    assert!(!ack.accepted);
    assert_eq!(ack.reason.as_deref(), Some("sharing_disabled"));

    x.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_connected_peers() {
    let (x, x_addr) = started("x", true).await;
    let (y, _) = started("y", true).await;
    y.submit_trace(None, trace_result("203.0.113.20")).await;
    assert!(y.add_bootstrap_peer(&x_addr).await);

    let mut events = x.subscribe();
    let sent = y.submit_trace(None, trace_result("203.0.113.30")).await;

    let id = sent.traceroute_id.clone();
    let arrived = eventually(|| {
        let x = &x;
        let id = id.clone();
        async move { x.shared_traces().await.iter().any(|t| t.traceroute_id == id) }
    })
    .await;
    assert!(arrived);

    let mut saw_event = false;
    while let Ok(event) = events.try_recv() {
        if let NodeEvent::TraceReceived(t) = event {
            saw_event |= t.traceroute_id == sent.traceroute_id;
        }
    }
    assert!(saw_event);

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn non_contributing_peers_learn_nothing_from_lists() {
    let (x, x_addr) = started("x", true).await;
    let (y, _) = started("y", true).await;

    // y has no traces yet, so x withholds its list
    assert!(y.add_bootstrap_peer(&x_addr).await);
    assert!(y.peers().await.is_empty());
    assert!(x.peers().await.iter().any(|p| p.peer_id == "y"));

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn stale_peers_are_evicted_but_fade_slowly() {
    let (x, _) = start(NodeConfig { peer_timeout_secs: 1, ..config("x", false) }).await;
    let (y, y_addr) = started("y", false).await;

    let mut events = x.subscribe();
    let ann = y.state().my_announcement().await;
    x.state().accept_announcement(&ann).await;
    assert_eq!(x.peers().await.len(), 1);
    assert!(matches!(events.recv().await, Ok(NodeEvent::PeerDiscovered(p)) if p.peer_id == "y"));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let report = x.maintenance_round().await;
    assert_eq!(report.evicted, vec!["y".to_string()]);
    assert!(x.peers().await.is_empty());
    assert!(matches!(events.recv().await, Ok(NodeEvent::PeerLost(id)) if id == "y"));

    let fading = x.peers_with_decay().await;
    assert_eq!(fading.len(), 1);
    assert_eq!(fading[0].0.address(), y_addr);
    assert_eq!(fading[0].1, 1.0);

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn leaderboard_updates_reach_peers() {
    let (x, x_addr) = started("x", true).await;
    let (y, _) = started("y", true).await;
    y.submit_trace(None, trace_result("203.0.113.20")).await;
    assert!(y.add_bootstrap_peer(&x_addr).await);

    let entry = geomesh_protocol::LeaderboardEntry {
        peer_id: "y".into(),
        display_name: "node y".into(),
        contribution_score: 42.0,
        traceroute_count: 1,
        uptime_seconds: 10,
    };
    let report = y.update_leaderboard(entry).await;
    assert_eq!(report.accepted(), 1);
    assert_eq!(x.leaderboard().await[0].peer_id, "y");

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn lifecycle_and_bind_failure() {
    let node = P2pNode::new(config("solo", false));
    assert_eq!(node.status().await, NodeStatus::Stopped);

    let addr = node.start().await.unwrap();
    assert_eq!(node.status().await, NodeStatus::Running);
    assert_eq!(node.state().port(), addr.port());
    assert!(matches!(node.start().await, Err(NodeError::AlreadyRunning)));

    let clash = P2pNode::new(NodeConfig { port: addr.port(), ..config("clash", false) });
    assert!(matches!(clash.start().await, Err(NodeError::Bind { .. })));
    assert_eq!(clash.status().await, NodeStatus::Stopped);

    node.stop().await;
    assert_eq!(node.status().await, NodeStatus::Stopped);
    assert!(node.local_addr().await.is_none());
}

#[tokio::test]
async fn unreachable_bootstrap_is_not_fatal() {
    let (x, _) = started("x", true).await;
    assert!(!x.add_bootstrap_peer("127.0.0.1:1").await);
    // second attempt counts as already known
    assert!(x.add_bootstrap_peer("127.0.0.1:1").await);
    assert_eq!(x.gossip_round().await, 0);
    x.stop().await;
}
