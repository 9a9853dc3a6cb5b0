//! Membership service: the gossiper plus the ring view it publishes
//!
//! All gossip state sits behind one mutex that only gossip rounds, digest
//! exchanges and the liveness timer take. The request path reads the
//! published [`RingView`] and never touches that mutex.

use crate::cluster::gossip::{GossipDigest, GossipSettings, Gossiper, Liveness};
use crate::cluster::ring_view::{RingView, SharedRing};
use crate::common::{vnode_tokens, Config, NodeId, NodeMetrics};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

pub struct Membership {
    local: NodeId,
    replication_factor: usize,
    gossiper: Mutex<Gossiper>,
    ring: SharedRing,
    metrics: Arc<NodeMetrics>,
}

impl Membership {
    /// Start as a ring of one; peers are learned through gossip.
    pub fn new(config: &Config, generation: u64, metrics: Arc<NodeMetrics>) -> Self {
        let local = config.node_id.clone();
        let tokens = vnode_tokens(&local, config.cluster.num_vnodes);
        let gossiper = Gossiper::new(
            local.clone(),
            generation,
            tokens,
            config.rack.clone(),
            GossipSettings::from(&config.cluster),
        );
        let view = build_view(&gossiper, 1, config.cluster.replication_factor);
        metrics.ring_version.set(view.version);

        Self {
            local,
            replication_factor: config.cluster.replication_factor,
            gossiper: Mutex::new(gossiper),
            ring: SharedRing::new(view),
            metrics,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Current snapshot; cheap and never blocks on gossip.
    pub fn view(&self) -> Arc<RingView> {
        self.ring.load()
    }

    /// Begin a gossip round: beat, re-check liveness and pick targets.
    pub fn start_round<R: Rng>(&self, rng: &mut R, now: Instant) -> (GossipDigest, Vec<NodeId>) {
        let mut gossiper = self.gossiper.lock();
        gossiper.beat();
        if gossiper.check_liveness(now) {
            self.publish(&gossiper);
        }
        self.metrics.gossip_rounds.inc();
        let targets = gossiper.targets(rng);
        (gossiper.digest(), targets)
    }

    /// Merge a digest received from a peer (either direction of a round).
    pub fn apply(&self, digest: &GossipDigest, now: Instant) -> bool {
        let mut gossiper = self.gossiper.lock();
        let changed = gossiper.apply_digest(digest, now);
        if changed {
            self.publish(&gossiper);
        }
        changed
    }

    pub fn digest(&self) -> GossipDigest {
        self.gossiper.lock().digest()
    }

    pub fn check_liveness(&self, now: Instant) -> bool {
        let mut gossiper = self.gossiper.lock();
        let changed = gossiper.check_liveness(now);
        if changed {
            self.publish(&gossiper);
        }
        changed
    }

    pub fn liveness(&self, node: &NodeId) -> Liveness {
        self.gossiper.lock().liveness(node)
    }

    /// Formally remove a dead peer from the ring.
    pub fn remove_peer(&self, node: &NodeId) -> bool {
        let mut gossiper = self.gossiper.lock();
        let removed = gossiper.remove_peer(node);
        if removed {
            self.publish(&gossiper);
        }
        removed
    }

    fn publish(&self, gossiper: &Gossiper) {
        let version = self.ring.load().version + 1;
        let view = build_view(gossiper, version, self.replication_factor);
        let live = view
            .members()
            .filter(|(node, liveness)| **node != self.local && *liveness == Liveness::Alive)
            .count();
        self.metrics.live_peers.set(live as u64);
        self.metrics.ring_version.set(version);
        tracing::debug!(
            "Published ring view v{} ({} member(s), topology {:016x})",
            version,
            view.ring().node_count(),
            view.topology
        );
        self.ring.store(view);
    }
}

fn build_view(gossiper: &Gossiper, version: u64, replication_factor: usize) -> RingView {
    RingView::new(
        version,
        gossiper.ring(),
        gossiper.liveness_map(),
        gossiper.racks(),
        replication_factor,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn membership(name: &str) -> Membership {
        let mut config = Config::for_node(name, "/tmp/unused");
        config.cluster.seeds = vec![NodeId::new("a")];
        Membership::new(&config, 1, Arc::new(NodeMetrics::new()))
    }

    #[test]
    fn test_starts_as_ring_of_one() {
        let m = membership("a");
        let view = m.view();
        assert_eq!(view.ring().node_count(), 1);
        assert_eq!(view.replicas_for(b"k"), vec![NodeId::new("a")]);
        assert_eq!(view.liveness(&NodeId::new("a")), Liveness::Alive);
    }

    #[test]
    fn test_apply_publishes_new_view() {
        let a = membership("a");
        let b = membership("b");
        let old = a.view();

        assert!(a.apply(&b.digest(), Instant::now()));
        let new = a.view();
        assert!(new.version > old.version);
        assert_ne!(new.topology, old.topology);
        assert_eq!(new.ring().node_count(), 2);
        // the reader's snapshot did not change underneath it
        assert_eq!(old.ring().node_count(), 1);
    }

    #[test]
    fn test_round_targets_seed() {
        let b = membership("b");
        let mut rng = StdRng::seed_from_u64(1);
        let (digest, targets) = b.start_round(&mut rng, Instant::now());
        assert_eq!(targets, vec![NodeId::new("a")]);
        assert_eq!(digest.endpoints[&NodeId::new("b")].heartbeat, 1);
        assert_eq!(b.metrics.gossip_rounds.get(), 1);
    }

    #[test]
    fn test_agreeing_nodes_share_topology() {
        let a = membership("a");
        let b = membership("b");
        let now = Instant::now();
        a.apply(&b.digest(), now);
        b.apply(&a.digest(), now);
        assert_eq!(a.view().topology, b.view().topology);
    }
}
