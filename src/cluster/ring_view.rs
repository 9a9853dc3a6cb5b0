//! Immutable ring snapshots
//!
//! The request path reads the ring on every operation while gossip only
//! rewrites it when membership or liveness changes. Readers clone an
//! `Arc<RingView>` and never observe a half-applied merge; writers build a
//! complete new view and swap the pointer.

use crate::cluster::gossip::Liveness;
use crate::cluster::partitioner::TokenRing;
use crate::common::{NodeId, Token};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

#[derive(Debug, Clone)]
pub struct RingView {
    /// Local publication counter
    pub version: u64,
    /// Fingerprint of members, tokens and racks; equal on nodes that agree
    /// on placement
    pub topology: u64,
    ring: TokenRing,
    liveness: HashMap<NodeId, Liveness>,
    racks: HashMap<NodeId, String>,
    replication_factor: usize,
}

impl RingView {
    pub fn new(
        version: u64,
        ring: TokenRing,
        liveness: HashMap<NodeId, Liveness>,
        racks: HashMap<NodeId, String>,
        replication_factor: usize,
    ) -> Self {
        let topology = fingerprint(&ring, &racks);
        Self {
            version,
            topology,
            ring,
            liveness,
            racks,
            replication_factor,
        }
    }

    /// Replicas for a partition key, in ring order.
    pub fn replicas_for(&self, key: &[u8]) -> Vec<NodeId> {
        self.ring
            .replicas_for_key(key, self.replication_factor, &self.racks)
    }

    pub fn replicas_for_token(&self, token: Token) -> Vec<NodeId> {
        self.ring
            .replica_set(token, self.replication_factor, &self.racks)
    }

    pub fn liveness(&self, node: &NodeId) -> Liveness {
        self.liveness
            .get(node)
            .copied()
            .unwrap_or(Liveness::Unknown)
    }

    pub fn is_dead(&self, node: &NodeId) -> bool {
        self.liveness(node) == Liveness::Dead
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.liveness(node) == Liveness::Alive
    }

    pub fn ring(&self) -> &TokenRing {
        &self.ring
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn members(&self) -> impl Iterator<Item = (&NodeId, Liveness)> {
        self.ring.nodes().map(|n| (n, self.liveness(n)))
    }
}

fn fingerprint(ring: &TokenRing, racks: &HashMap<NodeId, String>) -> u64 {
    let mut hasher = Xxh3::new();
    for node in ring.nodes() {
        hasher.update(node.as_str().as_bytes());
        hasher.update(&[0]);
        if let Some(rack) = racks.get(node) {
            hasher.update(rack.as_bytes());
        }
        hasher.update(&[0]);
        for token in ring.tokens_of(node) {
            hasher.update(&token.0.to_be_bytes());
        }
    }
    hasher.digest()
}

/// The published view; the write section only swaps the pointer.
#[derive(Debug)]
pub struct SharedRing {
    current: RwLock<Arc<RingView>>,
}

impl SharedRing {
    pub fn new(view: RingView) -> Self {
        Self {
            current: RwLock::new(Arc::new(view)),
        }
    }

    pub fn load(&self) -> Arc<RingView> {
        self.current.read().clone()
    }

    pub fn store(&self, view: RingView) {
        let view = Arc::new(view);
        *self.current.write() = view;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::vnode_tokens;

    fn view(names: &[&str], version: u64) -> RingView {
        let mut ring = TokenRing::new();
        for name in names {
            let id = NodeId::new(*name);
            let tokens = vnode_tokens(&id, 8);
            ring.add_node(id, tokens);
        }
        RingView::new(version, ring, HashMap::new(), HashMap::new(), 3)
    }

    #[test]
    fn test_topology_fingerprint() {
        assert_eq!(view(&["a", "b"], 1).topology, view(&["b", "a"], 7).topology);
        assert_ne!(view(&["a", "b"], 1).topology, view(&["a", "b", "c"], 1).topology);
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let shared = SharedRing::new(view(&["a", "b", "c"], 1));
        let before = shared.load();
        shared.store(view(&["a", "b", "c", "d"], 2));

        assert_eq!(before.version, 1);
        assert_eq!(before.ring().node_count(), 3);
        assert_eq!(shared.load().version, 2);
        assert_eq!(shared.load().ring().node_count(), 4);
    }

    #[test]
    fn test_unknown_liveness_is_not_dead() {
        let v = view(&["a"], 1);
        assert_eq!(v.liveness(&NodeId::new("zz")), Liveness::Unknown);
        assert!(!v.is_dead(&NodeId::new("a")));
        assert_eq!(v.replicas_for(b"k"), vec![NodeId::new("a")]);
    }
}
