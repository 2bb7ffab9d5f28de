mod common;

use common::*;
use geomesh_node::routes::MOBILE_TOKEN_HEADER;
use geomesh_protocol::*;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

fn client() -> PeerClient {
    PeerClient::new(Duration::from_secs(2))
}

#[tokio::test]
async fn gated_endpoints_need_a_contributing_proof() {
    let (node, addr) = started("gate", true).await;
    let c = client();

    let idle = proof_with(0);
    for proof in ["", "garbage", idle.as_str()] {
        assert!(matches!(c.peers(&addr, proof).await.unwrap(), Gated::Denied { .. }));
        assert!(matches!(c.topology(&addr, proof).await.unwrap(), Gated::Denied { .. }));
        let sync = c.full_sync(&addr, proof, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(sync, Gated::Denied { .. }));
    }

    let list = c.peers(&addr, &proof_with(2)).await.unwrap().granted().unwrap();
    assert_eq!(list.peers.len(), 1);
    assert_eq!(list.peers[0].peer_id, "gate");

    // denial body carries the table size
    let body: Value = reqwest::get(format!("http://{addr}/p2p/peers")).await.unwrap().json().await.unwrap();
    assert_eq!(body["message"], "Contribute to see full peer list");
    assert_eq!(body["peer_count"], 0);

    node.stop().await;
}

#[tokio::test]
async fn ping_and_announce() {
    let (node, addr) = started("hub", false).await;
    let c = client();

    let pong = c.ping(&addr, "stranger").await.unwrap();
    assert_eq!(pong.peer_id, "hub");
    assert_eq!(pong.protocol_version, PROTOCOL_VERSION);

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("http://{addr}/p2p/announce"))
        .json(&json!({ "peer_id": "", "host": "127.0.0.1", "port": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Missing peer_id");

    let (other, _) = started("other", false).await;
    let ann = other.state().my_announcement().await;
    let resp = c.announce(&addr, &ann, Duration::from_secs(2)).await.unwrap();
    assert!(resp.accepted);
    assert_eq!(resp.peer_id, "hub");
    assert_eq!(resp.peer_count, 1);

    // an unproven announcement never carries its proof into the table
    let stored = node.state().peers.get("other").await.unwrap();
    assert!(stored.contribution_proof.is_none());

    node.stop().await;
    other.stop().await;
}

#[tokio::test]
async fn topology_and_leaderboard_exchange() {
    let (node, addr) = started("hub", false).await;
    let c = client();

    let link = TopologyLink {
        source: "a".into(),
        target: "b".into(),
        latency_ms: Some(12.0),
        hop_count: 4,
        hops: Vec::new(),
        timestamp: chrono::Utc::now(),
    };
    assert!(c.push_topology(&addr, vec![link.clone(), link]).await.unwrap().accepted);
    let topo = c.topology(&addr, &proof_with(1)).await.unwrap().granted().unwrap();
    assert_eq!(topo.links.len(), 1);
    assert_eq!(topo.links[0].source, "a");

    for (id, score) in [("low", 1.0), ("high", 9.0)] {
        let entry = LeaderboardEntry {
            peer_id: id.into(),
            display_name: id.into(),
            contribution_score: score,
            traceroute_count: 1,
            uptime_seconds: 0,
        };
        assert!(c.push_leaderboard(&addr, &entry).await.unwrap().accepted);
    }
    let board = c.leaderboard(&addr).await.unwrap();
    let order: Vec<&str> = board.iter().map(|e| e.peer_id.as_str()).collect();
    assert_eq!(order, ["high", "low"]);

    node.stop().await;
}

#[tokio::test]
async fn direct_traceroute_submission_records_the_path() {
    let (node, addr) = started("hub", true).await;
    let sub = TracerouteSubmission {
        source_peer_id: "far".into(),
        source_display_name: Some("Far node".into()),
        target_peer_id: Some("hub".into()),
        target_display_name: None,
        traceroute: trace_result("192.0.2.9"),
    };
    assert!(client().submit_traceroute(&addr, &sub).await.unwrap().accepted);

    let topo = node.topology().await;
    assert_eq!(topo.links.len(), 1);
    assert_eq!(topo.links[0].hop_count, 3);
    let traces = node.shared_traces().await;
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].source_peer_id, "far");
    // someone else's trace does not count toward our contribution
    assert_eq!(node.my_stats().await.traceroute_count, 0);

    node.stop().await;
}

#[tokio::test]
async fn shard_store_and_query() {
    let (node, addr) = started("hub", false).await;
    let c = client();

    let cell = geohash::encode(51.5, -0.12, geohash::PRECISION_LOCAL);
    let fact = InfrastructureFact {
        ip: "198.51.100.1".into(),
        hostname: Some("ae1.linx.example.net".into()),
        kind: InfrastructureKind::Ixp,
        location: GeoPoint { latitude: 51.5, longitude: -0.12 },
        asn: None,
    };
    let item = ShardedData::permanent("infra_198.51.100.1", cell.clone(), ShardPayload::Infrastructure(fact), "far");
    let stored = c.store_shard(&addr, &item, Duration::from_secs(2)).await.unwrap();
    assert!(stored.accepted);
    assert!(stored.stored_locally);

    let prefix = &cell[..4];
    let found = c.query_shards(&addr, prefix, Some(DataType::Infrastructure), Duration::from_secs(2)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].data_id, "infra_198.51.100.1");
    assert!(c.query_shards(&addr, prefix, Some(DataType::Peer), Duration::from_secs(2)).await.unwrap().is_empty());

    let http = reqwest::Client::new();
    let body: Value = http
        .get(format!("http://{addr}/p2p/shard/query"))
        .query(&[("geohash", prefix), ("type", "bogus")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 1);

    let resp = http.get(format!("http://{addr}/p2p/shard/query")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Missing geohash");

    node.stop().await;
}

fn trace_shard(id: &str, timestamp: chrono::DateTime<chrono::Utc>, ttl: u64) -> Value {
    json!({
        "data": {
            "data_id": id,
            "geohash": "gcpvj",
            "payload": {
                "data_type": "traceroute",
                "data": { "traceroute_id": id, "source_peer_id": "stranger", "hop": { "hop_number": 1, "ip": "10.0.0.1", "rtt_ms": 1.0 } },
            },
            "timestamp": timestamp,
            "ttl_secs": ttl,
            "source_peer_id": "stranger",
        }
    })
}

#[tokio::test]
async fn shard_admission_edge_cases() {
    let (node, addr) = started("hub", false).await;
    let http = reqwest::Client::new();
    let store = |body: Value| {
        let http = http.clone();
        let url = format!("http://{addr}/p2p/shard/store");
        async move {
            let resp = http.post(url).json(&body).send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            resp.json::<ShardStoreResponse>().await.unwrap()
        }
    };
    let now = chrono::Utc::now();

    // a ttl past the calendar is kept as never expiring
    let huge = store(trace_shard("huge", now, u64::MAX)).await;
    assert!(huge.stored_locally);
    let overflow = store(trace_shard("overflow", now, 10_000_000_000_000)).await;
    assert!(overflow.stored_locally);

    let stale = store(trace_shard("stale", now - chrono::Duration::seconds(10), 0)).await;
    assert!(stale.accepted);
    assert!(!stale.stored_locally);
    let old = store(trace_shard("old", now - chrono::Duration::days(3), 86_400)).await;
    assert!(!old.stored_locally);

    // permanent facts are kept whoever sends them, whatever their age
    let fact = InfrastructureFact {
        ip: "203.0.113.99".into(),
        hostname: None,
        kind: InfrastructureKind::Datacenter,
        location: GeoPoint { latitude: 51.5, longitude: -0.12 },
        asn: None,
    };
    let mut item = ShardedData::permanent("infra_203.0.113.99", "gcpvj", ShardPayload::Infrastructure(fact), "stranger");
    item.timestamp = now - chrono::Duration::days(900);
    item.ttl_secs = 0;
    let permanent = store(serde_json::to_value(ShardStoreRequest { data: item }).unwrap()).await;
    assert!(permanent.stored_locally);

    let held: Vec<String> = node
        .state()
        .storage
        .local_by_geohash("gcpvj", None)
        .await
        .into_iter()
        .map(|d| d.data_id)
        .collect();
    assert!(held.contains(&"huge".to_string()));
    assert!(held.contains(&"overflow".to_string()));
    assert!(held.contains(&"infra_203.0.113.99".to_string()));
    assert!(!held.contains(&"stale".to_string()));
    assert!(!held.contains(&"old".to_string()));

    node.stop().await;
}

#[tokio::test]
async fn region_lists_local_traces() {
    let (node, addr) = started("hub", false).await;
    node.submit_trace(None, trace_result("203.0.113.10")).await;

    let region: RegionResponse = reqwest::Client::new()
        .get(format!("http://{addr}/p2p/shard/region"))
        .query(&[("lat", "51.5"), ("lon", "-0.12")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(region.geohash.len(), geohash::precision_for_zoom(10));
    assert_eq!(region.traceroutes.len(), 1);
    assert!(region.traceroutes[0].data_id.starts_with("tr_"));
    assert!(region.peers.is_empty());

    node.stop().await;
}

#[tokio::test]
async fn mobile_bridge_flow() {
    let (node, addr) = started("home", false).await;
    let http = reqwest::Client::new();
    let url = |path: &str| format!("http://{addr}{path}");

    let resp = http.post(url("/api/mobile/register")).json(&json!({})).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Authorization required");

    let reg: MobileRegisterResponse = http
        .post(url("/api/mobile/register"))
        .header("Authorization", "Bearer local-admin")
        .json(&json!({ "device_name": "Pixel" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reg.home_server.peer_id, "home");
    assert_eq!(reg.home_server.port, node.state().port());
    assert_eq!(reg.expires_in, 2_592_000);

    let resp = http
        .post(url("/api/mobile/traceroute"))
        .header(MOBILE_TOKEN_HEADER, "not-a-token")
        .json(&json!({ "target_ip": "1.1.1.1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Invalid token");

    let submission = MobileTraceSubmission {
        target_ip: "1.1.1.1".into(),
        hops: vec![located(1, "100.64.0.1", 48.85, 2.35)],
        total_time_ms: Some(40.0),
        success: true,
        carrier: Some("Example Mobile".into()),
    };
    let submitted: MobileSubmitResponse = http
        .post(url("/api/mobile/traceroute"))
        .header(MOBILE_TOKEN_HEADER, &reg.token)
        .json(&submission)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(submitted.accepted);

    let status: MobileStatus = http
        .get(url("/api/mobile/status"))
        .header(MOBILE_TOKEN_HEADER, &reg.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status.home_server.online);
    assert_eq!(status.recent_traceroutes.len(), 1);
    let trace = &status.recent_traceroutes[0];
    assert_eq!(trace.traceroute_id, submitted.traceroute_id);
    assert!(trace.is_mobile);
    assert_eq!(trace.target_peer_id.as_deref(), Some("home"));
    assert_eq!(trace.carrier.as_deref(), Some("Example Mobile"));

    let devices = node.mobile_devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_name, "Pixel");
    assert!(node.revoke_mobile_device(&devices[0].peer_id).await);

    let resp = http
        .get(url("/api/mobile/status"))
        .header(MOBILE_TOKEN_HEADER, &reg.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    node.stop().await;
}

#[tokio::test]
async fn oversized_bodies_are_refused() {
    let (node, addr) = start(geomesh_node::NodeConfig { body_limit: 1024, ..config("tiny", true) }).await;
    let padding = "x".repeat(4096);
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/p2p/ping"))
        .json(&json!({ "peer_id": padding }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    node.stop().await;
}
