//! geomesh overlay protocol
//!
//! Every node in the mesh is both a data producer and a shard holder.
//! Nodes find each other through a public rendezvous point, keep a peer
//! table fresh via gossip, and spread path traces over a geohash-sharded
//! store.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────┐  announce   ┌──────┐  announce   ┌──────┐
//!  │Node A│◄───────────►│Node B│◄───────────►│Node C│
//!  │ gcp  │             │ u09  │             │ gcp  │
//!  └──────┘             └──────┘             └──────┘
//!     ▲                                         ▲
//!     └──────── shard store / query ────────────┘
//! ```
//!
//! ## Membership
//! - Each node keeps a bounded peer table
//! - Periodically announces itself to a few peers and pulls their lists
//! - Peers that go quiet become stale and are evicted, then fade from view
//!
//! ## Sharding
//! - Items are keyed by `"{geohash region}:{data type}"`
//! - XOR distance over SHA-256 decides ownership and replica targets
//! - Infrastructure facts are permanent and replicated more widely
//!
//! ## Contribution gating
//! - Peer lists, topology, bulk sync and live streams need a fresh
//!   contribution proof showing at least one trace

pub mod client;
pub mod decay;
pub mod geohash;
pub mod peer;
pub mod proof;
pub mod router;
pub mod shard;
pub mod types;

pub use client::PeerClient;
pub use decay::NodeDecayManager;
pub use peer::{PeerInfo, PeerRegistry};
pub use router::DhtRouter;
pub use shard::{HttpShardNetwork, ShardNetwork, ShardedStorage};
pub use types::*;
