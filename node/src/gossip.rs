//! Outbound rounds: membership gossip, bootstrap, bulk sync and the
//! best-effort fan-outs that push traces, topology links and leaderboard entries.
//!
//! Nothing in here fails the caller because a peer misbehaved. Failures are
//! logged and the next round tries again.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use geomesh_protocol::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::state::{NodeState, TraceOrigin};

/// Concurrent calls per fan-out
const FANOUT_CONCURRENCY: usize = 8;

/// Announce ourselves to `address`, then pull its peer list.
/// Returns how many peers were new to us.
async fn exchange(state: &NodeState, address: &str, timeout: Duration) -> Result<usize> {
    let me = state.my_announcement().await;
    let resp = state.client.announce(address, &me, timeout).await?;
    if !resp.accepted {
        anyhow::bail!("Peer refused announcement");
    }
    state.peers.touch(&resp.peer_id).await;
    if state.peers.get(&resp.peer_id).await.is_some() {
        state.note_contact(&resp.peer_id).await;
    }
    request_peers(state, address).await
}

/// Pull a peer list with our proof attached
pub async fn request_peers(state: &NodeState, address: &str) -> Result<usize> {
    let proof = state.contribution_proof().await;
    match state.client.peers(address, &proof).await? {
        Gated::Granted(list) => Ok(state.merge_relayed(&list.peers).await),
        Gated::Denied { message, peer_count } => {
            tracing::debug!(peer = %address, peer_count, %message, "Peer list withheld");
            Ok(0)
        }
    }
}

/// One gossip pass over a few random peers. Falls back to the bootstrap
/// list when the table is empty. Returns successful exchanges.
pub async fn gossip_round(state: &NodeState) -> usize {
    let targets = state.peers.random_peers(state.config.gossip_fanout).await;
    if targets.is_empty() {
        return bootstrap(state).await;
    }

    let mut ok = 0;
    for peer in targets {
        match exchange(state, &peer.address(), state.config.http_timeout).await {
            Ok(new_peers) => {
                ok += 1;
                if new_peers > 0 {
                    tracing::info!(peer = %peer.label(), new_peers, "🗣️ Learned peers via gossip");
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer.peer_id, error = %e, "Gossip exchange failed");
                state.peers.record_failure(&peer.peer_id).await;
            }
        }
    }

    let peer_count = state.peers.count().await;
    tracing::debug!(peers = peer_count, exchanges = ok, "Gossip round complete");
    ok
}

/// Contact every known bootstrap address. Returns how many answered.
pub async fn bootstrap(state: &NodeState) -> usize {
    let seeds = state.bootstrap.read().await.clone();
    if seeds.is_empty() {
        return 0;
    }
    tracing::info!(node = %state.peer_id(), seeds = ?seeds, "🌱 Bootstrapping");

    let mut connected = 0;
    for seed in &seeds {
        match exchange(state, seed, state.config.bootstrap_timeout).await {
            Ok(new_peers) => {
                connected += 1;
                tracing::info!(seed = %seed, new_peers, "Connected to bootstrap peer");
            }
            Err(e) => tracing::warn!(seed = %seed, error = %e, "Failed to reach bootstrap peer"),
        }
    }
    let peer_count = state.peers.count().await;
    tracing::info!(peers = peer_count, "Bootstrap complete");
    connected
}

/// Remember an address found after startup and try it once. Addresses
/// already on the list count as connected.
pub async fn add_bootstrap_peer(state: &NodeState, address: &str) -> bool {
    if address == state.address() {
        return false;
    }
    {
        let mut seeds = state.bootstrap.write().await;
        if seeds.iter().any(|s| s == address) {
            return true;
        }
        seeds.push(address.to_string());
    }

    match exchange(state, address, state.config.bootstrap_timeout).await {
        Ok(new_peers) => {
            tracing::info!(peer = %address, new_peers, "Connected to discovered peer");
            true
        }
        Err(e) => {
            tracing::debug!(peer = %address, error = %e, "Discovered peer unreachable");
            false
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: Vec<NodeId>,
    pub expired_items: usize,
    pub expired_traces: usize,
}

/// Evict stale peers and drop expired data
pub async fn maintenance_round(state: &NodeState) -> MaintenanceReport {
    let report = MaintenanceReport {
        evicted: state.evict_stale().await,
        expired_items: state.storage.cleanup_expired().await,
        expired_traces: state.purge_old_traces().await,
    };
    if report.expired_items > 0 || report.expired_traces > 0 {
        tracing::debug!(items = report.expired_items, traces = report.expired_traces, "Expired data removed");
    }
    report
}

/// Pull shared traces from a few peers; the first that answers wins.
/// Does nothing while sharing is off. Returns how many traces were new.
pub async fn sync_round(state: &Arc<NodeState>) -> usize {
    if !state.sharing_enabled() {
        return 0;
    }
    state.publish_location().await;

    let targets = state.peers.random_peers(state.config.sync_fanout).await;
    if targets.is_empty() {
        return 0;
    }
    let proof = state.contribution_proof().await;

    let mut added = 0;
    for peer in targets {
        match state.client.full_sync(&peer.address(), &proof, state.config.sync_timeout).await {
            Ok(Gated::Granted(resp)) => {
                let received = resp.traceroutes.len();
                for trace in resp.traceroutes {
                    if state.ingest_trace(trace, TraceOrigin::Synced).await {
                        added += 1;
                    }
                }
                state.peers.touch(&peer.peer_id).await;
                tracing::info!(peer = %peer.label(), received, new = added, "🔄 Synced traces");
                break;
            }
            Ok(Gated::Denied { message, .. }) => {
                tracing::debug!(peer = %peer.peer_id, %message, "Sync refused");
            }
            Err(e) => {
                tracing::debug!(peer = %peer.peer_id, error = %e, "Sync failed");
                state.peers.record_failure(&peer.peer_id).await;
            }
        }
    }

    state.purge_old_traces().await;
    added
}

/// Run `call` against every target with bounded concurrency and a hard
/// timeout, collecting one outcome per peer
async fn fan_out<F, Fut>(targets: Vec<PeerInfo>, timeout: Duration, call: F) -> DeliveryReport
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Ack>>,
{
    let outcomes = stream::iter(targets)
        .map(|peer| {
            let fut = call(peer.address());
            async move {
                let outcome = match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(ack)) if ack.accepted => Delivery::Accepted,
                    Ok(Ok(_)) => Delivery::Rejected,
                    Ok(Err(e)) => Delivery::Failed(e.to_string()),
                    Err(_) => Delivery::TimedOut,
                };
                (peer.peer_id, outcome)
            }
        })
        .buffer_unordered(FANOUT_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;
    DeliveryReport { outcomes }
}

/// Push one trace to every active peer
pub async fn broadcast_trace(state: &NodeState, trace: &SharedTrace) -> DeliveryReport {
    let targets = state.peers.alive_peers().await;
    let report = fan_out(targets, state.config.http_timeout, |address| async move {
        state.client.broadcast(&address, trace).await
    })
    .await;
    tracing::debug!(
        trace = %trace.traceroute_id,
        accepted = report.accepted(),
        failed = report.failed(),
        "Broadcast trace"
    );
    report
}

/// Broadcast in the background so the submitter never waits on peers
pub(crate) fn spawn_broadcast(state: Arc<NodeState>, trace: SharedTrace) {
    tokio::spawn(async move {
        broadcast_trace(&state, &trace).await;
    });
}

/// Share new topology links with the first few peers
pub(crate) async fn push_links(state: &NodeState, links: Vec<TopologyLink>) -> DeliveryReport {
    let mut targets = state.peers.alive_peers().await;
    targets.truncate(DEFAULT_REPLICATION);
    let links = &links;
    fan_out(targets, state.config.http_timeout, |address| async move {
        state.client.push_topology(&address, links.clone()).await
    })
    .await
}

/// Update our own leaderboard entry and push it to a few peers
pub async fn push_leaderboard(state: &NodeState, entry: LeaderboardEntry) -> DeliveryReport {
    state.update_leaderboard_entry(entry.clone()).await;

    let mut targets = state.peers.alive_peers().await;
    targets.truncate(state.config.leaderboard_push_fanout);
    let entry = &entry;
    fan_out(targets, state.config.http_timeout, |address| async move {
        state.client.push_leaderboard(&address, entry).await
    })
    .await
}
