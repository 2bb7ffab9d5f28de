//! Contribution proofs.
//!
//! A proof is `"{canonical json}|{signature}"`. The JSON carries a one-way
//! hash of the subject id, the contribution counters, the issue time and a
//! random nonce. Anyone running this software can check a proof locally;
//! nothing in it identifies the issuer.

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::NETWORK_ID;

type HmacSha256 = Hmac<Sha256>;

/// Proofs older than this are rejected.
pub const MAX_PROOF_AGE_SECS: i64 = 86_400;

const SIGNATURE_BYTES: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("malformed proof")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("proof expired ({age_secs}s old)")]
    Expired { age_secs: i64 },
}

/// Counters a node reports about itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Contribution {
    pub traceroutes: u64,
    pub uptime_secs: u64,
}

/// The signed body of a proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub peer_id_hash: String,
    pub traceroutes: u64,
    pub uptime_hours: u64,
    pub timestamp: i64,
    pub nonce: String,
}

pub fn generate(subject_id: &str, contribution: &Contribution) -> String {
    generate_at(subject_id, contribution, Utc::now().timestamp())
}

pub fn generate_at(subject_id: &str, contribution: &Contribution, now: i64) -> String {
    let mut nonce = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut nonce);

    let subject = hex::encode(Sha256::digest(subject_id.as_bytes()));
    let record = ProofRecord {
        peer_id_hash: subject[..16].to_string(),
        traceroutes: contribution.traceroutes,
        uptime_hours: contribution.uptime_secs / 3600,
        timestamp: now,
        nonce: hex::encode(nonce),
    };

    let body = canonical_json(&record);
    let signature = sign(&body);
    format!("{body}|{signature}")
}

pub fn verify(proof: &str) -> Result<ProofRecord, ProofError> {
    verify_at(proof, Utc::now().timestamp())
}

pub fn verify_at(proof: &str, now: i64) -> Result<ProofRecord, ProofError> {
    let (body, signature) = proof.rsplit_once('|').ok_or(ProofError::Malformed)?;
    let signature = hex::decode(signature).map_err(|_| ProofError::Malformed)?;
    if signature.len() != SIGNATURE_BYTES {
        return Err(ProofError::BadSignature);
    }

    let mut mac = keyed_mac();
    mac.update(body.as_bytes());
    mac.verify_truncated_left(&signature)
        .map_err(|_| ProofError::BadSignature)?;

    let record: ProofRecord = serde_json::from_str(body).map_err(|_| ProofError::Malformed)?;
    let age_secs = now - record.timestamp;
    if age_secs > MAX_PROOF_AGE_SECS {
        return Err(ProofError::Expired { age_secs });
    }
    Ok(record)
}

/// Valid and at least `min_traceroutes` reported. Never fails: anything
/// unverifiable counts as not contributing.
pub fn is_contributing(proof: &str, min_traceroutes: u64) -> bool {
    match verify(proof) {
        Ok(record) => record.traceroutes >= min_traceroutes,
        Err(e) => {
            tracing::trace!(error = %e, "Rejected contribution proof");
            false
        }
    }
}

fn canonical_json(record: &ProofRecord) -> String {
    // serde_json::Map is a BTreeMap, so going through Value sorts the keys
    serde_json::to_value(record)
        .map(|v| v.to_string())
        .unwrap_or_default()
}

fn keyed_mac() -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(NETWORK_ID.as_bytes())
        .expect("HMAC accepts keys of any length")
}

fn sign(body: &str) -> String {
    let mut mac = keyed_mac();
    mac.update(body.as_bytes());
    let tag = mac.finalize().into_bytes();
    hex::encode(&tag[..SIGNATURE_BYTES])
}
