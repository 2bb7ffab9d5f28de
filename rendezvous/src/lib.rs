//! Serverless peer discovery for geomesh nodes.
//!
//! Three independent channels feed one verifier:
//! - the public BitTorrent mainline DHT, keyed by a hash of the network id
//! - a pub/sub topic on a local content-addressed storage daemon
//! - DNS TXT records listing long-lived seed nodes
//!
//! Candidates only reach the node after answering a `/p2p/ping` handshake.

pub mod bencode;
pub mod dht;
pub mod discovery;
pub mod dns;
pub mod pubsub;

pub use dht::{DhtClient, DhtConfig};
pub use discovery::{
    AutoDiscovery, Candidate, CandidateVerifier, DiscoveredPeer, DiscoveryChannel, DiscoveryConfig,
    DiscoveryMethod, HttpVerifier,
};
pub use dns::DnsFallback;
pub use pubsub::PubSubRelay;
