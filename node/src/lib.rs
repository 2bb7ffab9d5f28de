//! A geomesh peer.
//!
//! [`P2pNode`] owns the HTTP/WebSocket surface other nodes and phones talk
//! to, plus the gossip, maintenance, stats and sync loops that keep its view
//! of the mesh fresh. Trace execution and hop enrichment are supplied by the
//! host through the traits in [`collab`].

pub mod collab;
pub mod config;
pub mod error;
pub mod gossip;
pub mod live;
pub mod mobile;
pub mod node;
pub mod routes;
pub mod state;
pub mod storage;

pub use collab::{HopEnricher, PassthroughEnricher, TraceRunner};
pub use config::NodeConfig;
pub use error::{MobileAuthError, NodeError};
pub use node::{NodeStatus, P2pNode};
pub use state::{NodeEvent, NodeState};
