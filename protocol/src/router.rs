//! XOR-distance keyspace math.
//!
//! Node ids and shard keys are both hashed with SHA-256 into the same
//! 256-bit space. Distances are big-endian byte arrays, so ordinary array
//! comparison orders them numerically.

use sha2::{Digest, Sha256};

use crate::types::PeerAddr;

pub type Distance = [u8; 32];

pub fn key_hash(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> Distance {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// `floor(2^256 * replication / total)`, valid for `replication < total`.
fn ownership_threshold(replication: usize, total: usize) -> Distance {
    // Long division of the 320-bit numerator [replication | 32 zero bytes]
    let mut numerator = [0u8; 40];
    numerator[..8].copy_from_slice(&(replication as u64).to_be_bytes());

    let divisor = total as u128;
    let mut quotient = [0u8; 40];
    let mut rem: u128 = 0;
    for (q, n) in quotient.iter_mut().zip(numerator.iter()) {
        rem = (rem << 8) | *n as u128;
        *q = (rem / divisor) as u8;
        rem %= divisor;
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&quotient[8..]);
    out
}

/// Decides shard ownership and replica placement for one node.
#[derive(Debug, Clone)]
pub struct DhtRouter {
    node_id: String,
    node_hash: [u8; 32],
}

impl DhtRouter {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let node_hash = key_hash(&node_id);
        Self { node_id, node_hash }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Distance from this node to `key`
    pub fn distance(&self, key: &str) -> Distance {
        xor(&self.node_hash, &key_hash(key))
    }

    /// Distance between any id and any key
    pub fn distance_between(id: &str, key: &str) -> Distance {
        xor(&key_hash(id), &key_hash(key))
    }

    /// Small swarms replicate everything. Otherwise this node stores the
    /// shard when its distance falls in the closest `replication / total`
    /// fraction of the keyspace.
    pub fn should_store(&self, shard_key: &str, total_nodes: usize, replication: usize) -> bool {
        if total_nodes <= replication {
            return true;
        }
        self.distance(shard_key) < ownership_threshold(replication, total_nodes)
    }

    /// The `replication` peers nearest to `shard_key`, nearest first.
    pub fn closest_nodes(&self, shard_key: &str, peers: &[PeerAddr], replication: usize) -> Vec<PeerAddr> {
        let key = key_hash(shard_key);
        let mut ranked: Vec<(Distance, &PeerAddr)> = peers
            .iter()
            .map(|p| (xor(&key_hash(&p.peer_id), &key), p))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0));
        ranked.into_iter().take(replication).map(|(_, p)| p.clone()).collect()
    }
}
