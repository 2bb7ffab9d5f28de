use anyhow::Result;
use chrono::Utc;
use geomesh_protocol::shard::StorageStats;
use geomesh_protocol::*;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;

use crate::collab::{HopEnricher, PassthroughEnricher, TraceRunner};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::gossip::{self, MaintenanceReport};
use crate::routes;
use crate::state::{new_trace_id, NodeEvent, NodeState, TraceOrigin};
use crate::storage;

/// How long `stop` waits for the listener to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `stop` lets a round in progress finish before aborting it
const LOOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// A mesh participant: HTTP/WebSocket surface plus its background loops
pub struct P2pNode {
    state: Arc<NodeState>,
    status: RwLock<NodeStatus>,
    running: Mutex<Option<Running>>,
}

impl P2pNode {
    pub fn new(config: NodeConfig) -> Self {
        Self::with_enricher(config, Arc::new(PassthroughEnricher))
    }

    pub fn with_enricher(config: NodeConfig, enricher: Arc<dyn HopEnricher>) -> Self {
        Self {
            state: NodeState::new(config, enricher),
            status: RwLock::new(NodeStatus::Stopped),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn peer_id(&self) -> &str {
        self.state.peer_id()
    }

    pub async fn status(&self) -> NodeStatus {
        *self.status.read().await
    }

    async fn set_status(&self, status: NodeStatus) {
        *self.status.write().await = status;
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Bind, restore state, start serving and launch the loops.
    /// Only a bind failure is fatal.
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }
        self.set_status(NodeStatus::Starting).await;

        let config = &self.state.config;
        let bind = format!("{}:{}", config.bind_host, config.port);
        let listener = match TcpListener::bind(&bind).await {
            Ok(l) => l,
            Err(source) => {
                self.set_status(NodeStatus::Stopped).await;
                return Err(NodeError::Bind { addr: bind, source });
            }
        };
        let addr = match listener.local_addr() {
            Ok(a) => a,
            Err(source) => {
                self.set_status(NodeStatus::Stopped).await;
                return Err(NodeError::Bind { addr: bind, source });
            }
        };
        self.state.set_port(addr.port());

        if let Err(e) = storage::load_state(&self.state).await {
            tracing::warn!("Failed to load persisted state: {e}");
        }
        {
            let mut seeds = self.state.bootstrap.write().await;
            for seed in &config.bootstrap_peers {
                if !seeds.contains(seed) {
                    seeds.push(seed.clone());
                }
            }
        }
        if let Some(loc) = config.location {
            self.state.set_location(loc.latitude, loc.longitude).await;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let app = routes::create_router(Arc::clone(&self.state)).layer(CorsLayer::permissive());
        let mut server_rx = shutdown_rx.clone();
        let server = tokio::spawn(async move {
            let graceful = async move {
                let _ = server_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(graceful).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        });

        let tasks = self.spawn_loops(&shutdown_rx);

        *running = Some(Running { addr, shutdown, server, tasks });
        self.set_status(NodeStatus::Running).await;
        tracing::info!(
            node = %self.state.peer_id(),
            name = %config.label(),
            %addr,
            sharing = self.state.sharing_enabled(),
            "🚀 Node started"
        );
        Ok(addr)
    }

    fn spawn_loops(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let config = &self.state.config;
        let mut tasks = Vec::new();

        let state = Arc::clone(&self.state);
        tasks.push(tokio::spawn(async move {
            gossip::bootstrap(&state).await;
        }));

        let state = Arc::clone(&self.state);
        tasks.push(spawn_loop("gossip", config.gossip_interval, config.gossip_interval, shutdown.clone(), move || {
            let state = Arc::clone(&state);
            async move {
                gossip::gossip_round(&state).await;
            }
        }));

        let state = Arc::clone(&self.state);
        tasks.push(spawn_loop(
            "maintenance",
            config.maintenance_interval,
            config.maintenance_interval,
            shutdown.clone(),
            move || {
                let state = Arc::clone(&state);
                async move {
                    gossip::maintenance_round(&state).await;
                }
            },
        ));

        let state = Arc::clone(&self.state);
        tasks.push(spawn_loop("stats", config.stats_interval, config.stats_interval, shutdown.clone(), move || {
            let state = Arc::clone(&state);
            async move {
                state.refresh_uptime().await;
                if let Err(e) = storage::save_state(&state).await {
                    tracing::warn!("Failed to save state: {e}");
                }
            }
        }));

        let state = Arc::clone(&self.state);
        tasks.push(spawn_loop("sync", config.sync_delay, config.sync_interval, shutdown.clone(), move || {
            let state = Arc::clone(&state);
            async move {
                gossip::sync_round(&state).await;
            }
        }));

        tasks
    }

    /// Signal the loops, let rounds in progress finish, drain the listener,
    /// save. Rounds still running after the grace period are aborted.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else { return };
        self.set_status(NodeStatus::Stopping).await;

        let _ = running.shutdown.send(true);
        join_or_abort(running.tasks, LOOP_GRACE).await;
        if tokio::time::timeout(DRAIN_TIMEOUT, running.server).await.is_err() {
            tracing::warn!("Listener did not drain in time");
        }
        if let Err(e) = storage::save_state(&self.state).await {
            tracing::warn!("Failed to save state: {e}");
        }

        self.set_status(NodeStatus::Stopped).await;
        tracing::info!(node = %self.state.peer_id(), "Node stopped");
    }

    // -----------------------------------------------------------------------
    // Host API
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.state.subscribe()
    }

    pub async fn set_location(&self, lat: f64, lon: f64) -> String {
        self.state.set_location(lat, lon).await
    }

    pub fn set_sharing_enabled(&self, enabled: bool) {
        self.state.set_sharing_enabled(enabled);
    }

    pub fn sharing_enabled(&self) -> bool {
        self.state.sharing_enabled()
    }

    /// Load a map region in the background the first time it is viewed
    pub async fn set_viewed_region(&self, lat: f64, lon: f64, zoom: u8) {
        if let Some(cell) = self.state.view_region(lat, lon, zoom).await {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                state.load_region(&cell).await;
            });
        }
    }

    /// Record one of our own traces and spread it as far as sharing allows
    pub async fn submit_trace(&self, target_peer_id: Option<&str>, result: TraceResult) -> SharedTrace {
        let state = &self.state;
        let link = state.record_trace_link(state.peer_id(), target_peer_id, &result).await;
        state.count_own_trace(result.hops.len()).await;

        let target_display_name = match target_peer_id {
            Some(id) => state.peers.get(id).await.map(|p| p.label().to_string()),
            None => None,
        };
        let trace = SharedTrace {
            traceroute_id: new_trace_id(),
            source_peer_id: state.config.peer_id.clone(),
            source_display_name: Some(state.config.display_name.clone()),
            target_peer_id: target_peer_id.map(str::to_string),
            target_ip: result.target,
            target_display_name,
            timestamp: Utc::now(),
            hops: result.hops,
            total_time_ms: result.total_time_ms,
            success: result.success,
            is_mobile: false,
            carrier: None,
        };
        state.ingest_trace(trace.clone(), TraceOrigin::Local).await;

        if let Some(link) = link.filter(|_| state.sharing_enabled()) {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                gossip::push_links(&state, vec![link]).await;
            });
        }
        trace
    }

    /// Run a trace through the collaborator, enrich it, submit it
    pub async fn trace_and_submit(
        &self,
        runner: &dyn TraceRunner,
        target: &str,
        target_peer_id: Option<&str>,
    ) -> Result<SharedTrace> {
        let mut result = runner.trace(target, true).await?;
        result.hops = self.state.enricher().enrich(result.hops).await;
        Ok(self.submit_trace(target_peer_id, result).await)
    }

    pub async fn add_bootstrap_peer(&self, address: &str) -> bool {
        gossip::add_bootstrap_peer(&self.state, address).await
    }

    pub async fn update_leaderboard(&self, entry: LeaderboardEntry) -> DeliveryReport {
        gossip::push_leaderboard(&self.state, entry).await
    }

    pub async fn mark_infrastructure(&self, peer_id: &str) {
        self.state.mark_infrastructure_peer(peer_id).await;
    }

    pub async fn mobile_devices(&self) -> Vec<MobileDevice> {
        self.state.mobile.devices().await
    }

    pub async fn revoke_mobile_device(&self, peer_id: &str) -> bool {
        self.state.mobile.revoke(peer_id).await
    }

    // Snapshots

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.state.peers.alive_peers().await
    }

    pub async fn peers_with_decay(&self) -> Vec<(PeerInfo, f64)> {
        self.state.peers_with_decay().await
    }

    pub async fn topology(&self) -> Topology {
        self.state.topology().await
    }

    pub async fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        self.state.leaderboard().await
    }

    pub async fn my_stats(&self) -> NodeStats {
        self.state.my_stats().await
    }

    pub async fn shared_traces(&self) -> Vec<SharedTrace> {
        self.state.shared_traces().await
    }

    pub async fn all_hops(&self) -> Vec<Hop> {
        self.state.all_hops().await
    }

    pub async fn storage_stats(&self) -> StorageStats {
        self.state.storage.stats().await
    }

    // Single rounds, for hosts that drive their own schedule

    pub async fn gossip_round(&self) -> usize {
        gossip::gossip_round(&self.state).await
    }

    pub async fn sync_round(&self) -> usize {
        gossip::sync_round(&self.state).await
    }

    pub async fn maintenance_round(&self) -> MaintenanceReport {
        gossip::maintenance_round(&self.state).await
    }
}

/// Run `tick` every `period`, first after `delay`, until shutdown flips
fn spawn_loop<F, Fut>(
    name: &'static str,
    delay: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(Instant::now() + delay, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(task = name, "Loop stopped");
    })
}

/// Wait for every task up to a shared deadline, abort the rest
async fn join_or_abort(tasks: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    for mut task in tasks {
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            tracing::warn!("Background round outlived shutdown, aborting");
            task.abort();
        }
    }
}
