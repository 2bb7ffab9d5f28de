//! Last-resort bootstrap list published as DNS TXT records.
//!
//! Each record holds one `host:port`. The list is maintained out of band,
//! so this channel cannot announce.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::discovery::{Candidate, DiscoveryChannel, DiscoveryMethod};

pub const DEFAULT_DOMAINS: &[&str] = &["_haimish-bootstrap.haimish.org"];

/// Split `host:port` at the last colon
pub fn parse_record(record: &str) -> Option<(String, u16)> {
    let (host, port) = record.trim().rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

pub struct DnsFallback {
    domains: Vec<String>,
    timeout: Duration,
}

impl DnsFallback {
    pub fn new(domains: Vec<String>) -> Self {
        Self { domains, timeout: Duration::from_secs(5) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn lookup(&self, resolver: &TokioAsyncResolver, domain: &str) -> Result<Vec<String>> {
        let response = tokio::time::timeout(self.timeout, resolver.txt_lookup(domain))
            .await
            .context("TXT lookup timed out")?
            .context("TXT lookup failed")?;

        Ok(response
            .iter()
            .map(|record| {
                record
                    .iter()
                    .map(|data| String::from_utf8_lossy(data.as_ref()).to_string())
                    .collect::<String>()
            })
            .collect())
    }
}

#[async_trait]
impl DiscoveryChannel for DnsFallback {
    fn method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Dns
    }

    async fn candidates(&self) -> Result<Vec<Candidate>> {
        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);

        let mut found = Vec::new();
        for domain in &self.domains {
            match self.lookup(&resolver, domain).await {
                Ok(records) => {
                    for txt in records {
                        match parse_record(&txt) {
                            Some((host, port)) => found.push(Candidate::new(host, port, DiscoveryMethod::Dns)),
                            None => tracing::debug!(domain = %domain, record = %txt, "Ignoring TXT record"),
                        }
                    }
                }
                Err(e) => tracing::debug!(domain = %domain, error = %e, "DNS bootstrap lookup failed"),
            }
        }
        Ok(found)
    }

    fn can_announce(&self) -> bool {
        false
    }

    async fn announce(&self, _host: &str, _port: u16, _peer_id: &str) -> Result<()> {
        anyhow::bail!("DNS seed records are read-only")
    }
}
