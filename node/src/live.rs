use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use geomesh_protocol::LiveEvent;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::state::NodeState;

const LIVE_BUFFER: usize = 256;

/// Fan-out point for frames pushed to every open live connection
pub struct LiveHub {
    tx: broadcast::Sender<LiveEvent>,
    clients: AtomicUsize,
}

impl Default for LiveHub {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(LIVE_BUFFER);
        Self { tx, clients: AtomicUsize::new(0) }
    }
}

impl LiveHub {
    /// Returns how many connections will see the event
    pub fn publish(&self, event: LiveEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LiveParams {
    #[serde(default)]
    pub proof: Option<String>,
}

#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
}

pub async fn ws_handler(
    State(state): State<Arc<NodeState>>,
    Query(params): Query<LiveParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let allowed = state.is_contributing(params.proof.as_deref());
    ws.on_upgrade(move |socket| async move {
        if allowed {
            serve_client(state, socket).await;
        } else {
            reject(socket).await;
        }
    })
}

fn frame(event: &LiveEvent) -> Option<Message> {
    serde_json::to_string(event).ok().map(|s| Message::Text(s.into()))
}

async fn reject(mut socket: WebSocket) {
    let event = LiveEvent::Error { error: "Contribute to receive live updates".into() };
    if let Some(msg) = frame(&event) {
        let _ = socket.send(msg).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn serve_client(state: Arc<NodeState>, mut socket: WebSocket) {
    // subscribe before the snapshot so nothing falls between the two
    let mut updates = state.live.subscribe();
    let total = state.live.clients.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(clients = total, "🔌 Live client connected");

    let initial = LiveEvent::Initial {
        traceroutes: state.shareable_traces().await,
        peers: state.peers.announcements().await,
    };
    let mut open = match frame(&initial) {
        Some(msg) => socket.send(msg).await.is_ok(),
        None => false,
    };

    while open {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let is_ping = serde_json::from_str::<ClientFrame>(text.as_str())
                        .map(|f| f.kind == "ping")
                        .unwrap_or(false);
                    if is_ping {
                        let pong = LiveEvent::Pong { timestamp: Utc::now() };
                        if let Some(msg) = frame(&pong) {
                            open = socket.send(msg).await.is_ok();
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => open = false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Live socket error");
                    open = false;
                }
            },
            update = updates.recv() => match update {
                Ok(event) => {
                    if let Some(msg) = frame(&event) {
                        open = socket.send(msg).await.is_ok();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Live client lagging, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => open = false,
            },
        }
    }

    let remaining = state.live.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    tracing::info!(clients = remaining, "Live client disconnected");
}
