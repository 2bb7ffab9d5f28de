use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Full visibility lasts this long after the last contact
pub const DECAY_START_AFTER: Duration = Duration::from_secs(300);
/// Then visibility fades linearly to zero over this window
pub const FULL_DECAY_TIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct NodeDecay {
    last_seen: Instant,
    is_infrastructure: bool,
}

impl NodeDecay {
    fn factor_at(&self, now: Instant) -> f64 {
        if self.is_infrastructure {
            return 1.0;
        }
        let since = now.saturating_duration_since(self.last_seen);
        if since < DECAY_START_AFTER {
            return 1.0;
        }
        let progress = (since - DECAY_START_AFTER).as_secs_f64() / FULL_DECAY_TIME.as_secs_f64();
        (1.0 - progress).max(0.0)
    }
}

/// Time-based fade of peers that stop answering. Infrastructure never fades.
#[derive(Debug, Default)]
pub struct NodeDecayManager {
    nodes: HashMap<String, NodeDecay>,
}

impl NodeDecayManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_node(&mut self, peer_id: &str, is_infrastructure: bool) {
        self.update_node_at(peer_id, is_infrastructure, Instant::now());
    }

    pub fn update_node_at(&mut self, peer_id: &str, is_infrastructure: bool, now: Instant) {
        self.nodes
            .entry(peer_id.to_string())
            .and_modify(|n| {
                n.last_seen = now;
                n.is_infrastructure |= is_infrastructure;
            })
            .or_insert(NodeDecay { last_seen: now, is_infrastructure });
    }

    pub fn mark_infrastructure(&mut self, peer_id: &str) {
        if let Some(node) = self.nodes.get_mut(peer_id) {
            node.is_infrastructure = true;
        }
    }

    /// 1.0 is fully visible. Unknown ids are invisible.
    pub fn decay_factor(&self, peer_id: &str) -> f64 {
        self.decay_factor_at(peer_id, Instant::now())
    }

    pub fn decay_factor_at(&self, peer_id: &str, now: Instant) -> f64 {
        self.nodes.get(peer_id).map_or(0.0, |n| n.factor_at(now))
    }

    /// Every node with a non-zero factor. Fully faded nodes are dropped here.
    pub fn visible_nodes(&mut self) -> Vec<(String, f64)> {
        self.visible_nodes_at(Instant::now())
    }

    pub fn visible_nodes_at(&mut self, now: Instant) -> Vec<(String, f64)> {
        let mut visible = Vec::with_capacity(self.nodes.len());
        self.nodes.retain(|id, node| {
            let factor = node.factor_at(now);
            if factor <= 0.0 {
                tracing::debug!(peer = %id, "Node fully decayed");
                return false;
            }
            visible.push((id.clone(), factor));
            true
        });
        visible
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
