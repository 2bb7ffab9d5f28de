//! Bridge for phones tracing back to their home node.
//!
//! A registered device gets an opaque bearer token bound to a synthetic
//! peer id. Tokens are checked for presence and expiry only.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use geomesh_protocol::{MobileDevice, NodeId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::MobileAuthError;

pub const DEFAULT_DEVICE_NAME: &str = "Mobile Device";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileToken {
    pub peer_id: NodeId,
    pub device_name: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub home_peer_id: NodeId,
}

impl MobileToken {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires
    }

    fn device(&self) -> MobileDevice {
        MobileDevice {
            device_name: self.device_name.clone(),
            peer_id: self.peer_id.clone(),
            created: self.created,
            expires: self.expires,
        }
    }
}

pub struct MobileRegistry {
    tokens: RwLock<HashMap<String, MobileToken>>,
    lifetime: Duration,
}

impl MobileRegistry {
    pub fn new(lifetime: std::time::Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            lifetime: Duration::from_std(lifetime).unwrap_or_else(|_| Duration::days(30)),
        }
    }

    pub fn lifetime_secs(&self) -> u64 {
        self.lifetime.num_seconds().max(0) as u64
    }

    /// Issue a fresh token for a device
    pub async fn register(&self, device_name: Option<String>, home_peer_id: &str) -> (String, MobileToken) {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let token = URL_SAFE_NO_PAD.encode(secret);

        let now = Utc::now();
        let entry = MobileToken {
            peer_id: format!("mobile_{}", hex::encode(rand::random::<[u8; 8]>())),
            device_name: device_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
            created: now,
            expires: now + self.lifetime,
            home_peer_id: home_peer_id.to_string(),
        };
        tracing::info!(device = %entry.device_name, peer = %entry.peer_id, "📱 Mobile device registered");
        self.tokens.write().await.insert(token.clone(), entry.clone());
        (token, entry)
    }

    /// Look up a token. Expired tokens are dropped on the way.
    pub async fn authorize(&self, token: Option<&str>) -> Result<MobileToken, MobileAuthError> {
        self.authorize_at(token, Utc::now()).await
    }

    pub async fn authorize_at(&self, token: Option<&str>, now: DateTime<Utc>) -> Result<MobileToken, MobileAuthError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(MobileAuthError::InvalidToken)?;
        let mut tokens = self.tokens.write().await;
        let entry = tokens.get(token).ok_or(MobileAuthError::InvalidToken)?;
        if entry.is_expired_at(now) {
            tokens.remove(token);
            return Err(MobileAuthError::Expired);
        }
        Ok(entry.clone())
    }

    /// Devices with a live token
    pub async fn devices(&self) -> Vec<MobileDevice> {
        let now = Utc::now();
        let mut devices: Vec<MobileDevice> = self.tokens
            .read()
            .await
            .values()
            .filter(|t| !t.is_expired_at(now))
            .map(MobileToken::device)
            .collect();
        devices.sort_by_key(|d| d.created);
        devices
    }

    pub async fn revoke(&self, peer_id: &str) -> bool {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.peer_id != peer_id);
        let revoked = tokens.len() < before;
        if revoked {
            tracing::info!(peer = %peer_id, "Mobile device revoked");
        }
        revoked
    }

    pub async fn snapshot(&self) -> HashMap<String, MobileToken> {
        self.tokens.read().await.clone()
    }

    pub async fn restore(&self, saved: HashMap<String, MobileToken>) {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        tokens.extend(saved.into_iter().filter(|(_, t)| !t.is_expired_at(now)));
    }
}
