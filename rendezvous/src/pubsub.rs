//! Discovery over a local pub/sub daemon's HTTP API.
//!
//! Nodes publish a small JSON record on a shared topic and collect what
//! others publish. Messages arrive base64-wrapped inside newline-delimited
//! JSON envelopes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::discovery::{Candidate, DiscoveryChannel, DiscoveryMethod};

pub const DEFAULT_API: &str = "http://127.0.0.1:5001";
pub const TOPIC: &str = "/haimish/discovery/v1";

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);
const RESUBSCRIBE_AFTER: Duration = Duration::from_secs(30);
const MAX_PENDING: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    host: String,
    port: u16,
    #[serde(default)]
    peer_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
struct Envelope {
    data: String,
}

/// Decode one line of the subscription stream
pub fn parse_message(line: &[u8]) -> Option<Candidate> {
    let envelope: Envelope = serde_json::from_slice(line).ok()?;
    let raw = STANDARD.decode(envelope.data.trim()).ok()?;
    let ann: Announcement = serde_json::from_slice(&raw).ok()?;
    if ann.host.is_empty() || ann.port == 0 {
        return None;
    }
    let candidate = Candidate::new(ann.host, ann.port, DiscoveryMethod::PubSub);
    Some(match ann.peer_id {
        Some(id) => candidate.with_peer_id(id),
        None => candidate,
    })
}

/// Base64 payload published for this node
pub fn encode_announcement(host: &str, port: u16, peer_id: &str) -> String {
    let ann = Announcement {
        host: host.to_string(),
        port,
        peer_id: Some(peer_id.to_string()),
        timestamp: Some(chrono::Utc::now().timestamp()),
    };
    // A struct of strings and integers always serializes
    STANDARD.encode(serde_json::to_vec(&ann).unwrap_or_default())
}

pub struct PubSubRelay {
    api: String,
    http: reqwest::Client,
    available: AtomicBool,
    pending: Arc<Mutex<Vec<Candidate>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubRelay {
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            api: api.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            available: AtomicBool::new(false),
            pending: Arc::new(Mutex::new(Vec::new())),
            task: Mutex::new(None),
        }
    }

    pub async fn is_reachable(&self) -> bool {
        let ok = self.http
            .post(format!("{}/api/v0/id", self.api))
            .timeout(REACHABILITY_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        self.available.store(ok, Ordering::Relaxed);
        ok
    }

    /// Check the daemon and, when it answers, keep a subscription running
    /// in the background. Returns whether the relay is usable.
    pub async fn start(&self) -> bool {
        if !self.is_reachable().await {
            return false;
        }
        let http = self.http.clone();
        let api = self.api.clone();
        let pending = self.pending.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = subscribe(&http, &api, &pending).await {
                    tracing::debug!(error = %e, "Pub/sub subscription dropped");
                }
                tokio::time::sleep(RESUBSCRIBE_AFTER).await;
            }
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        tracing::info!(api = %self.api, topic = TOPIC, "Pub/sub discovery enabled");
        true
    }

    pub async fn publish(&self, host: &str, port: u16, peer_id: &str) -> Result<()> {
        let form = reqwest::multipart::Form::new().text("data", encode_announcement(host, port, peer_id));
        let resp = self.http
            .post(format!("{}/api/v0/pubsub/pub", self.api))
            .query(&[("arg", TOPIC)])
            .multipart(form)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("Failed to reach pub/sub daemon")?;
        if !resp.status().is_success() {
            anyhow::bail!("pubsub publish: HTTP {}", resp.status());
        }
        Ok(())
    }

    fn drain(&self) -> Vec<Candidate> {
        self.pending.lock().map(|mut p| std::mem::take(&mut *p)).unwrap_or_default()
    }
}

async fn subscribe(http: &reqwest::Client, api: &str, pending: &Mutex<Vec<Candidate>>) -> Result<()> {
    let resp = http
        .post(format!("{api}/api/v0/pubsub/sub"))
        .query(&[("arg", TOPIC)])
        .send()
        .await
        .context("Failed to open subscription")?;
    if !resp.status().is_success() {
        anyhow::bail!("pubsub subscribe: HTTP {}", resp.status());
    }

    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk.context("Subscription stream error")?);
        while let Some(newline) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=newline).collect();
            let Some(candidate) = parse_message(&line) else { continue };
            tracing::debug!(addr = %candidate.address(), "Pub/sub announcement");
            if let Ok(mut p) = pending.lock() {
                if p.len() < MAX_PENDING && !p.contains(&candidate) {
                    p.push(candidate);
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DiscoveryChannel for PubSubRelay {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::PubSub
    }

    async fn is_active(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn candidates(&self) -> Result<Vec<Candidate>> {
        Ok(self.drain())
    }

    async fn announce(&self, host: &str, port: u16, peer_id: &str) -> Result<()> {
        self.publish(host, port, peer_id).await
    }

    fn shutdown(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        self.available.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "from": "12D3KooW",
            "data": STANDARD.encode(payload),
            "seqno": "AAE=",
        }))
        .unwrap()
    }

    #[test]
    fn parses_published_announcement() {
        let line = envelope(r#"{"host":"198.51.100.4","port":8765,"peer_id":"abc"}"#);
        let c = parse_message(&line).unwrap();
        assert_eq!(c.address(), "198.51.100.4:8765");
        assert_eq!(c.peer_id.as_deref(), Some("abc"));
        assert_eq!(c.method, DiscoveryMethod::PubSub);
    }

    #[test]
    fn rejects_junk() {
        assert!(parse_message(b"not json").is_none());
        assert!(parse_message(br#"{"data":"%%%"}"#).is_none());
        assert!(parse_message(&envelope(r#"{"host":"","port":1}"#)).is_none());
        assert!(parse_message(&envelope(r#"{"host":"a","port":0}"#)).is_none());
    }

    #[test]
    fn own_announcement_parses_back() {
        let data = encode_announcement("203.0.113.9", 8000, "me");
        let line = serde_json::to_vec(&serde_json::json!({ "data": data })).unwrap();
        let c = parse_message(&line).unwrap();
        assert_eq!(c.address(), "203.0.113.9:8000");
        assert_eq!(c.peer_id.as_deref(), Some("me"));
    }

    #[tokio::test]
    async fn unreachable_daemon_is_inactive() {
        let relay = PubSubRelay::new("http://127.0.0.1:1");
        assert!(!relay.start().await);
        assert!(!relay.is_active().await);
        assert!(relay.candidates().await.unwrap().is_empty());
    }
}
