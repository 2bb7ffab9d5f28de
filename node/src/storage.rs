use anyhow::{Context, Result};
use geomesh_protocol::{LeaderboardEntry, PeerInfo, TopologyLink};
use std::collections::HashMap;
use std::path::Path;

use crate::mobile::MobileToken;
use crate::state::{NodeState, TraceRecord};

const PEERS_FILE: &str = "peers.json";
const TRACES_FILE: &str = "traces.json";
const TOPOLOGY_FILE: &str = "topology.json";
const LEADERBOARD_FILE: &str = "leaderboard.json";
const MOBILE_FILE: &str = "mobile_tokens.json";

async fn write_json<T: serde::Serialize>(dir: &Path, file: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(dir.join(file), json)
        .await
        .with_context(|| format!("Failed to write {file}"))
}

async fn read_json<T: serde::de::DeserializeOwned>(dir: &Path, file: &str) -> Option<T> {
    let data = tokio::fs::read_to_string(dir.join(file)).await.ok()?;
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(file, error = %e, "Ignoring unreadable snapshot");
            None
        }
    }
}

/// Write every table to `dir`. Without a configured directory this is a no-op.
pub async fn save_state(state: &NodeState) -> Result<()> {
    let Some(dir) = state.config.data_dir.as_deref() else { return Ok(()) };
    tokio::fs::create_dir_all(dir).await?;

    write_json(dir, PEERS_FILE, &state.peers.all().await).await?;
    write_json(dir, TRACES_FILE, &*state.traces.read().await).await?;
    write_json(dir, TOPOLOGY_FILE, &*state.links.read().await).await?;
    write_json(dir, LEADERBOARD_FILE, &*state.leaderboard.read().await).await?;
    write_json(dir, MOBILE_FILE, &state.mobile.snapshot().await).await?;

    tracing::debug!(dir = %dir.display(), "State saved");
    Ok(())
}

/// Missing or corrupt files are skipped
pub async fn load_state(state: &NodeState) -> Result<()> {
    let Some(dir) = state.config.data_dir.as_deref() else { return Ok(()) };

    if let Some(peers) = read_json::<Vec<PeerInfo>>(dir, PEERS_FILE).await {
        let ids: Vec<String> = peers.iter().map(|p| p.peer_id.clone()).collect();
        state.peers.restore(peers).await;
        for id in ids {
            if state.peers.get(&id).await.is_some() {
                state.note_contact(&id).await;
            }
        }
        state.refresh_routing().await;
    }
    if let Some(traces) = read_json::<HashMap<String, TraceRecord>>(dir, TRACES_FILE).await {
        state.traces.write().await.extend(traces);
        state.purge_old_traces().await;
    }
    if let Some(links) = read_json::<Vec<TopologyLink>>(dir, TOPOLOGY_FILE).await {
        state.merge_links(links).await;
    }
    if let Some(board) = read_json::<Vec<LeaderboardEntry>>(dir, LEADERBOARD_FILE).await {
        for entry in board {
            state.update_leaderboard_entry(entry).await;
        }
    }
    if let Some(tokens) = read_json::<HashMap<String, MobileToken>>(dir, MOBILE_FILE).await {
        state.mobile.restore(tokens).await;
    }

    tracing::info!(
        dir = %dir.display(),
        peers = state.peers.all().await.len(),
        traces = state.traces.read().await.len(),
        "Loaded persisted state"
    );
    Ok(())
}
