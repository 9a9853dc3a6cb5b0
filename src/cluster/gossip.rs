//! Gossip membership state and failure detector
//!
//! Every node keeps an [`EndpointState`] per known member and periodically
//! swaps digests with a few random peers. Merging keeps, per member, the
//! entry with the highest `(generation, heartbeat)`, so the merge is
//! total, commutative and idempotent.
//!
//! Liveness is local opinion and is never gossiped: a peer is `Alive`
//! while its heartbeat keeps increasing (first- or second-hand), `Suspect`
//! after a few silent intervals and `Dead` after `dead_timeout`.
//!
//! [`Gossiper`] is a plain state machine; time is passed in so the node
//! drives it from timers and tests drive it directly.

use crate::cluster::partitioner::TokenRing;
use crate::common::{ClusterConfig, NodeId, Token};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Chance per round of also gossiping with a seed or a dead peer.
const EXTRA_CONTACT_PROBABILITY: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Normal,
    /// Formally removed from the ring
    Left,
}

/// What a node announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointState {
    /// Start epoch of the node; a restart begins a new generation
    pub generation: u64,
    pub heartbeat: u64,
    pub status: MemberStatus,
    pub tokens: Vec<Token>,
    pub rack: Option<String>,
}

impl EndpointState {
    pub fn version(&self) -> (u64, u64) {
        (self.generation, self.heartbeat)
    }
}

/// A node's full view, exchanged in both directions of a gossip round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    pub from: NodeId,
    pub endpoints: BTreeMap<NodeId, EndpointState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
    Unknown,
    Alive,
    Suspect,
    Dead,
}

impl Liveness {
    /// Worth contacting for requests and gossip.
    pub fn is_reachable(self) -> bool {
        matches!(self, Liveness::Alive | Liveness::Unknown)
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Liveness::Unknown => "unknown",
            Liveness::Alive => "alive",
            Liveness::Suspect => "suspect",
            Liveness::Dead => "dead",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct PeerTracker {
    liveness: Liveness,
    /// Last time the peer's version advanced (or when it was first heard of)
    last_progress: Instant,
}

/// Timing knobs taken from [`ClusterConfig`].
#[derive(Debug, Clone)]
pub struct GossipSettings {
    pub fanout: usize,
    pub suspect_after: Duration,
    pub dead_timeout: Duration,
    pub seeds: Vec<NodeId>,
}

impl From<&ClusterConfig> for GossipSettings {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            fanout: config.gossip_fanout.max(1),
            suspect_after: config.gossip_interval * config.suspect_after_intervals.max(1),
            dead_timeout: config.dead_timeout,
            seeds: config.seeds.clone(),
        }
    }
}

pub struct Gossiper {
    local: NodeId,
    endpoints: BTreeMap<NodeId, EndpointState>,
    trackers: HashMap<NodeId, PeerTracker>,
    settings: GossipSettings,
}

impl Gossiper {
    pub fn new(
        local: NodeId,
        generation: u64,
        tokens: Vec<Token>,
        rack: Option<String>,
        settings: GossipSettings,
    ) -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            local.clone(),
            EndpointState {
                generation,
                heartbeat: 0,
                status: MemberStatus::Normal,
                tokens,
                rack,
            },
        );
        Self {
            local,
            endpoints,
            trackers: HashMap::new(),
            settings,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Advance our own heartbeat; called once per round.
    pub fn beat(&mut self) {
        if let Some(state) = self.endpoints.get_mut(&self.local) {
            state.heartbeat += 1;
        }
    }

    pub fn digest(&self) -> GossipDigest {
        GossipDigest {
            from: self.local.clone(),
            endpoints: self.endpoints.clone(),
        }
    }

    pub fn endpoint(&self, node: &NodeId) -> Option<&EndpointState> {
        self.endpoints.get(node)
    }

    /// Merge a remote view. Returns true when the ring or any peer's
    /// liveness changed.
    pub fn apply_digest(&mut self, digest: &GossipDigest, now: Instant) -> bool {
        let mut changed = false;
        for (node, remote) in &digest.endpoints {
            if *node == self.local {
                continue;
            }
            let newer = match self.endpoints.get(node) {
                Some(known) => remote.version() > known.version(),
                None => true,
            };
            if !newer {
                continue;
            }

            let previous = self.endpoints.insert(node.clone(), remote.clone());
            match &previous {
                Some(old) => {
                    if old.status != remote.status
                        || old.tokens != remote.tokens
                        || old.rack != remote.rack
                    {
                        changed = true;
                    }
                }
                None => {
                    tracing::info!("Discovered peer {} via {}", node, digest.from);
                    changed = true;
                }
            }

            changed |= self.record_progress(node, previous.is_none(), remote.status, now);
        }
        changed
    }

    fn record_progress(
        &mut self,
        node: &NodeId,
        first_sight: bool,
        status: MemberStatus,
        now: Instant,
    ) -> bool {
        if status == MemberStatus::Left {
            let removed = self.trackers.remove(node).is_some();
            if removed {
                tracing::info!("Peer {} left the ring", node);
            }
            return removed;
        }

        let tracker = self
            .trackers
            .entry(node.clone())
            .or_insert_with(|| PeerTracker {
                liveness: Liveness::Unknown,
                last_progress: now,
            });
        tracker.last_progress = now;
        if first_sight || tracker.liveness == Liveness::Alive {
            return false;
        }
        let was = tracker.liveness;
        tracker.liveness = Liveness::Alive;
        if was != Liveness::Unknown {
            tracing::info!("Peer {} is alive again (was {})", node, was);
        }
        true
    }

    /// Re-evaluate every peer against the timeouts. Returns true when any
    /// liveness changed.
    pub fn check_liveness(&mut self, now: Instant) -> bool {
        let mut changed = false;
        for (node, tracker) in self.trackers.iter_mut() {
            let silent = now.saturating_duration_since(tracker.last_progress);
            let next = if silent >= self.settings.dead_timeout {
                Liveness::Dead
            } else if silent >= self.settings.suspect_after && tracker.liveness != Liveness::Unknown {
                Liveness::Suspect
            } else {
                tracker.liveness
            };
            if next != tracker.liveness {
                match next {
                    Liveness::Dead => tracing::warn!("Peer {} marked dead after {:?} of silence", node, silent),
                    _ => tracing::info!("Peer {} is {}", node, next),
                }
                tracker.liveness = next;
                changed = true;
            }
        }
        changed
    }

    pub fn liveness(&self, node: &NodeId) -> Liveness {
        if *node == self.local {
            return Liveness::Alive;
        }
        self.trackers
            .get(node)
            .map_or(Liveness::Unknown, |t| t.liveness)
    }

    /// Liveness of every member still in the ring, ourselves included.
    pub fn liveness_map(&self) -> HashMap<NodeId, Liveness> {
        self.endpoints
            .iter()
            .filter(|(_, state)| state.status == MemberStatus::Normal)
            .map(|(node, _)| (node.clone(), self.liveness(node)))
            .collect()
    }

    /// Peers to contact this round: `fanout` random reachable peers, a seed
    /// when none is reachable (or occasionally anyway), and now and then a
    /// dead or suspect peer so recoveries are noticed.
    pub fn targets<R: Rng>(&self, rng: &mut R) -> Vec<NodeId> {
        let mut reachable = Vec::new();
        let mut unreachable = Vec::new();
        for (node, state) in &self.endpoints {
            if *node == self.local || state.status == MemberStatus::Left {
                continue;
            }
            if self.liveness(node).is_reachable() {
                reachable.push(node.clone());
            } else {
                unreachable.push(node.clone());
            }
        }

        let mut targets: Vec<NodeId> = reachable
            .choose_multiple(rng, self.settings.fanout)
            .cloned()
            .collect();

        let seeds: Vec<&NodeId> = self
            .settings
            .seeds
            .iter()
            .filter(|s| **s != self.local)
            .collect();
        if targets.is_empty() || rng.gen_bool(EXTRA_CONTACT_PROBABILITY) {
            if let Some(seed) = seeds.choose(rng) {
                if !targets.contains(*seed) {
                    targets.push((*seed).clone());
                }
            }
        }
        if !unreachable.is_empty() && rng.gen_bool(EXTRA_CONTACT_PROBABILITY) {
            if let Some(peer) = unreachable.choose(rng) {
                if !targets.contains(peer) {
                    targets.push(peer.clone());
                }
            }
        }
        targets
    }

    /// Formally remove a dead member. The bumped heartbeat makes the
    /// removal win the merge everywhere.
    pub fn remove_peer(&mut self, node: &NodeId) -> bool {
        if *node == self.local || self.liveness(node) != Liveness::Dead {
            return false;
        }
        let Some(state) = self.endpoints.get_mut(node) else {
            return false;
        };
        state.status = MemberStatus::Left;
        state.heartbeat += 1;
        self.trackers.remove(node);
        tracing::info!("Removed dead peer {} from the ring", node);
        true
    }

    /// Ring built from every member with `Normal` status.
    pub fn ring(&self) -> TokenRing {
        let mut ring = TokenRing::new();
        for (node, state) in &self.endpoints {
            if state.status == MemberStatus::Normal {
                ring.add_node(node.clone(), state.tokens.clone());
            }
        }
        ring
    }

    pub fn racks(&self) -> HashMap<NodeId, String> {
        self.endpoints
            .iter()
            .filter(|(_, state)| state.status == MemberStatus::Normal)
            .filter_map(|(node, state)| state.rack.clone().map(|r| (node.clone(), r)))
            .collect()
    }

    pub fn members(&self) -> impl Iterator<Item = (&NodeId, &EndpointState)> {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::vnode_tokens;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn settings() -> GossipSettings {
        GossipSettings {
            fanout: 2,
            suspect_after: Duration::from_secs(3),
            dead_timeout: Duration::from_secs(10),
            seeds: vec![NodeId::new("a")],
        }
    }

    fn gossiper(name: &str) -> Gossiper {
        let id = NodeId::new(name);
        let tokens = vnode_tokens(&id, 4);
        Gossiper::new(id, 1, tokens, None, settings())
    }

    /// Push-pull exchange between two gossipers.
    fn exchange(a: &mut Gossiper, b: &mut Gossiper, now: Instant) {
        let da = a.digest();
        b.apply_digest(&da, now);
        let db = b.digest();
        a.apply_digest(&db, now);
    }

    #[test]
    fn test_highest_heartbeat_wins() {
        let mut a = gossiper("a");
        let mut b = gossiper("b");
        let now = Instant::now();
        exchange(&mut a, &mut b, now);
        assert_eq!(a.endpoint(&NodeId::new("b")).unwrap().heartbeat, 0);

        b.beat();
        b.beat();
        let stale = b.digest();
        b.beat();
        exchange(&mut a, &mut b, now);
        assert_eq!(a.endpoint(&NodeId::new("b")).unwrap().heartbeat, 3);

        // an older digest never rolls state back
        a.apply_digest(&stale, now);
        assert_eq!(a.endpoint(&NodeId::new("b")).unwrap().heartbeat, 3);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let mut b = gossiper("b");
        let mut c = gossiper("c");
        b.beat();
        c.beat();
        c.beat();
        let (db, dc) = (b.digest(), c.digest());
        let now = Instant::now();

        let mut x = gossiper("a");
        x.apply_digest(&db, now);
        x.apply_digest(&dc, now);
        let mut y = gossiper("a");
        y.apply_digest(&dc, now);
        y.apply_digest(&db, now);
        y.apply_digest(&db, now);
        assert_eq!(x.digest(), y.digest());
    }

    #[test]
    fn test_own_entry_never_overwritten() {
        let mut a = gossiper("a");
        let mut forged = a.digest();
        forged.from = NodeId::new("b");
        if let Some(state) = forged.endpoints.get_mut(&NodeId::new("a")) {
            state.heartbeat = 1_000;
            state.status = MemberStatus::Left;
        }
        a.apply_digest(&forged, Instant::now());
        assert_eq!(a.endpoint(&NodeId::new("a")).unwrap().heartbeat, 0);
        assert_eq!(a.endpoint(&NodeId::new("a")).unwrap().status, MemberStatus::Normal);
    }

    #[test]
    fn test_failure_detector_transitions() {
        let mut a = gossiper("a");
        let mut b = gossiper("b");
        let b_id = NodeId::new("b");
        let t0 = Instant::now();

        exchange(&mut a, &mut b, t0);
        assert_eq!(a.liveness(&b_id), Liveness::Unknown);

        b.beat();
        exchange(&mut a, &mut b, t0 + Duration::from_secs(1));
        assert_eq!(a.liveness(&b_id), Liveness::Alive);

        assert!(a.check_liveness(t0 + Duration::from_secs(5)));
        assert_eq!(a.liveness(&b_id), Liveness::Suspect);

        assert!(a.check_liveness(t0 + Duration::from_secs(12)));
        assert_eq!(a.liveness(&b_id), Liveness::Dead);

        b.beat();
        assert!(a.apply_digest(&b.digest(), t0 + Duration::from_secs(13)));
        assert_eq!(a.liveness(&b_id), Liveness::Alive);
    }

    #[test]
    fn test_unknown_peer_goes_dead_without_suspect() {
        let mut a = gossiper("a");
        let b = gossiper("b");
        let t0 = Instant::now();
        a.apply_digest(&b.digest(), t0);

        assert!(!a.check_liveness(t0 + Duration::from_secs(5)));
        assert_eq!(a.liveness(&NodeId::new("b")), Liveness::Unknown);
        assert!(a.check_liveness(t0 + Duration::from_secs(11)));
        assert_eq!(a.liveness(&NodeId::new("b")), Liveness::Dead);
    }

    #[test]
    fn test_remove_peer_only_when_dead() {
        let mut a = gossiper("a");
        let mut b = gossiper("b");
        let mut c = gossiper("c");
        let t0 = Instant::now();
        exchange(&mut a, &mut b, t0);
        exchange(&mut a, &mut c, t0);
        assert_eq!(a.ring().node_count(), 3);

        assert!(!a.remove_peer(&NodeId::new("b")));
        a.check_liveness(t0 + Duration::from_secs(11));
        assert!(a.remove_peer(&NodeId::new("b")));
        assert_eq!(a.ring().node_count(), 2);

        // the removal spreads through gossip
        let later = t0 + Duration::from_secs(12);
        exchange(&mut a, &mut c, later);
        assert!(!c.ring().contains(&NodeId::new("b")));
        assert!(!c.liveness_map().contains_key(&NodeId::new("b")));
    }

    #[test]
    fn test_targets_fall_back_to_seed() {
        let mut rng = StdRng::seed_from_u64(7);
        let b = gossiper("b");
        assert_eq!(b.targets(&mut rng), vec![NodeId::new("a")]);

        let mut a = gossiper("a");
        // the seed itself knows nobody and has no other seed
        assert!(a.targets(&mut rng).is_empty());

        let c = gossiper("c");
        let d = gossiper("d");
        let now = Instant::now();
        a.apply_digest(&c.digest(), now);
        a.apply_digest(&d.digest(), now);
        let targets = a.targets(&mut rng);
        assert_eq!(targets.len(), 2);
        assert!(!targets.contains(&NodeId::new("a")));
    }
}
