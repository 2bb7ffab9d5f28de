//! Seams to the parts of the system that live outside the overlay: running
//! a path trace and enriching its hops.

use anyhow::Result;
use async_trait::async_trait;
use geomesh_protocol::{Hop, InfrastructureKind, TraceResult};

/// Runs one path trace. The hop list is finite and not restartable.
#[async_trait]
pub trait TraceRunner: Send + Sync {
    async fn trace(&self, target: &str, enrich: bool) -> Result<TraceResult>;
}

/// Adds geolocation, ASN data and an infrastructure class to hops.
#[async_trait]
pub trait HopEnricher: Send + Sync {
    async fn enrich(&self, hops: Vec<Hop>) -> Vec<Hop>;

    /// `Some` when the hop is a long-lived facility worth keeping forever
    fn classify(&self, hop: &Hop) -> Option<InfrastructureKind> {
        classify_hop(hop)
    }
}

/// Leaves hops as they are and classifies from what they already carry
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEnricher;

#[async_trait]
impl HopEnricher for PassthroughEnricher {
    async fn enrich(&self, hops: Vec<Hop>) -> Vec<Hop> {
        hops
    }
}

const CELL_PATTERNS: &[&str] = &["cell", "tower", "lte", "5g", "enodeb", "gnodeb"];
const DATACENTER_PATTERNS: &[&str] = &["datacenter", "colo", "equinix", "interxion"];
const IXP_PATTERNS: &[&str] = &["exchange", "peering", "linx", "amsix", "decix"];

/// Explicit class first, then ASN category, then hostname patterns.
/// Two-letter markers (`dc`, `ix`) only count as whole hostname labels.
pub fn classify_hop(hop: &Hop) -> Option<InfrastructureKind> {
    if hop.infrastructure.is_some() {
        return hop.infrastructure;
    }

    if let Some(category) = hop.asn.as_ref().and_then(|a| a.category.as_deref()) {
        match category.to_ascii_lowercase().as_str() {
            "mobile" | "cellular" => return Some(InfrastructureKind::CellTower),
            "cloud" | "hosting" | "cdn" => return Some(InfrastructureKind::Datacenter),
            _ => {}
        }
    }

    let hostname = hop.hostname.as_deref()?.to_ascii_lowercase();
    let labels: Vec<&str> = hostname.split(|c: char| c == '.' || c == '-').collect();
    let contains_any = |patterns: &[&str]| patterns.iter().any(|p| hostname.contains(p));

    if contains_any(CELL_PATTERNS) {
        Some(InfrastructureKind::CellTower)
    } else if contains_any(DATACENTER_PATTERNS) || labels.contains(&"dc") {
        Some(InfrastructureKind::Datacenter)
    } else if contains_any(IXP_PATTERNS) || labels.contains(&"ix") {
        Some(InfrastructureKind::Ixp)
    } else {
        None
    }
}
