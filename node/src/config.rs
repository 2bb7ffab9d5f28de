use geomesh_protocol::GeoPoint;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub peer_id: String,
    pub display_name: String,
    /// Host other nodes should use to reach us
    pub host: String,
    pub bind_host: String,
    /// 0 picks a free port at start
    pub port: u16,
    /// Off unless the operator opts in
    pub share_data: bool,
    pub location: Option<GeoPoint>,
    pub bootstrap_peers: Vec<String>,
    /// Snapshots are written here when set
    pub data_dir: Option<PathBuf>,

    pub max_peers: usize,
    pub peer_timeout_secs: u64,
    pub gossip_interval: Duration,
    pub gossip_fanout: usize,
    pub maintenance_interval: Duration,
    pub stats_interval: Duration,
    pub sync_delay: Duration,
    pub sync_interval: Duration,
    pub sync_fanout: usize,

    pub http_timeout: Duration,
    pub bootstrap_timeout: Duration,
    pub shard_query_timeout: Duration,
    pub sync_timeout: Duration,

    pub trace_max_age: Duration,
    pub peer_location_ttl_secs: u64,
    pub mobile_token_lifetime: Duration,
    pub min_contribution: u64,
    pub leaderboard_size: usize,
    pub leaderboard_push_fanout: usize,
    pub body_limit: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: uuid::Uuid::new_v4().simple().to_string(),
            display_name: String::new(),
            host: "127.0.0.1".into(),
            bind_host: "0.0.0.0".into(),
            port: 0,
            share_data: false,
            location: None,
            bootstrap_peers: Vec::new(),
            data_dir: None,

            max_peers: 50,
            peer_timeout_secs: 600,
            gossip_interval: Duration::from_secs(60),
            gossip_fanout: 5,
            maintenance_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(60),
            sync_delay: Duration::from_secs(30),
            sync_interval: Duration::from_secs(300),
            sync_fanout: 5,

            http_timeout: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(10),
            shard_query_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(30),

            trace_max_age: Duration::from_secs(86_400),
            peer_location_ttl_secs: 3_600,
            mobile_token_lifetime: Duration::from_secs(30 * 86_400),
            min_contribution: 1,
            leaderboard_size: 100,
            leaderboard_push_fanout: 3,
            body_limit: 10 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.peer_id
        } else {
            &self.display_name
        }
    }
}
