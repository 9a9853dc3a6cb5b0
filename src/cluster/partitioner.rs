//! Token ring with virtual nodes
//!
//! Each physical node owns several tokens; a token owns the range from the
//! previous token (exclusive) up to itself. The replicas of a key are the
//! first N distinct nodes found walking clockwise from the key's token.

use crate::common::{token_for, NodeId, Token};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRing {
    ring: BTreeMap<Token, NodeId>,
    members: BTreeMap<NodeId, Vec<Token>>,
}

impl TokenRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or re-add) a node with its vnode tokens.
    pub fn add_node(&mut self, node: NodeId, tokens: Vec<Token>) {
        self.members.insert(node, tokens);
        self.rebuild();
    }

    pub fn remove_node(&mut self, node: &NodeId) -> bool {
        let removed = self.members.remove(node).is_some();
        if removed {
            self.rebuild();
        }
        removed
    }

    /// Two nodes claiming the same token: the smaller node id keeps it, so
    /// every node derives the same ring from the same membership.
    fn rebuild(&mut self) {
        self.ring.clear();
        for (node, tokens) in &self.members {
            for token in tokens {
                self.ring.entry(*token).or_insert_with(|| node.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.members.keys()
    }

    pub fn node_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains_key(node)
    }

    pub fn tokens_of(&self, node: &NodeId) -> &[Token] {
        self.members.get(node).map_or(&[], |t| t.as_slice())
    }

    /// Tokens in ring order with their owners.
    pub fn tokens(&self) -> impl Iterator<Item = (&Token, &NodeId)> {
        self.ring.iter()
    }

    /// Owner of the range containing `token`.
    pub fn primary(&self, token: Token) -> Option<&NodeId> {
        self.walk(token).next()
    }

    /// Ring owners starting at `token`, wrapping around once.
    fn walk(&self, token: Token) -> impl Iterator<Item = &NodeId> {
        self.ring
            .range(token..)
            .chain(self.ring.range(..token))
            .map(|(_, node)| node)
    }

    /// Up to `n` distinct nodes clockwise from `token`.
    ///
    /// With rack information, a node whose rack is already represented is
    /// passed over while other racks remain; passed-over nodes fill the set
    /// if there are not enough racks.
    pub fn replica_set(
        &self,
        token: Token,
        n: usize,
        racks: &HashMap<NodeId, String>,
    ) -> Vec<NodeId> {
        let mut replicas: Vec<NodeId> = Vec::with_capacity(n);
        let mut deferred: Vec<NodeId> = Vec::new();
        let mut seen: HashSet<&NodeId> = HashSet::new();
        let mut used_racks: HashSet<&str> = HashSet::new();

        for node in self.walk(token) {
            if replicas.len() == n || seen.len() == self.members.len() {
                break;
            }
            if !seen.insert(node) {
                continue;
            }
            match racks.get(node) {
                Some(rack) if used_racks.contains(rack.as_str()) => deferred.push(node.clone()),
                Some(rack) => {
                    used_racks.insert(rack.as_str());
                    replicas.push(node.clone());
                }
                None => replicas.push(node.clone()),
            }
        }

        for node in deferred {
            if replicas.len() == n {
                break;
            }
            replicas.push(node);
        }
        replicas
    }

    pub fn replicas_for_key(
        &self,
        key: &[u8],
        n: usize,
        racks: &HashMap<NodeId, String>,
    ) -> Vec<NodeId> {
        self.replica_set(token_for(key), n, racks)
    }

    /// Share of the token space each node is primary for, in [0, 1].
    pub fn ownership(&self) -> BTreeMap<NodeId, f64> {
        let mut owned: BTreeMap<NodeId, u128> = BTreeMap::new();
        let tokens: Vec<(&Token, &NodeId)> = self.ring.iter().collect();
        for (i, (token, node)) in tokens.iter().enumerate() {
            let prev = if i == 0 {
                tokens[tokens.len() - 1].0
            } else {
                tokens[i - 1].0
            };
            let span = token.0.wrapping_sub(prev.0);
            let entry = owned.entry((*node).clone()).or_default();
            *entry = entry.saturating_add(span);
        }
        // a single token owns the whole ring
        if tokens.len() == 1 {
            owned.insert(tokens[0].1.clone(), u128::MAX);
        }
        owned
            .into_iter()
            .map(|(node, span)| (node, span as f64 / u128::MAX as f64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::vnode_tokens;

    fn ring_of(names: &[&str], vnodes: usize) -> TokenRing {
        let mut ring = TokenRing::new();
        for name in names {
            let id = NodeId::new(*name);
            let tokens = vnode_tokens(&id, vnodes);
            ring.add_node(id, tokens);
        }
        ring
    }

    #[test]
    fn test_replica_set_distinct_nodes() {
        let ring = ring_of(&["a", "b", "c", "d"], 16);
        for i in 0..100 {
            let replicas = ring.replicas_for_key(format!("k{}", i).as_bytes(), 3, &HashMap::new());
            assert_eq!(replicas.len(), 3);
            let distinct: HashSet<_> = replicas.iter().collect();
            assert_eq!(distinct.len(), 3);
        }
    }

    #[test]
    fn test_replica_set_capped_by_node_count() {
        let ring = ring_of(&["a", "b"], 8);
        let replicas = ring.replicas_for_key(b"k", 3, &HashMap::new());
        assert_eq!(replicas.len(), 2);
        assert!(TokenRing::new()
            .replicas_for_key(b"k", 3, &HashMap::new())
            .is_empty());
    }

    #[test]
    fn test_primary_is_first_replica() {
        let ring = ring_of(&["a", "b", "c"], 16);
        let token = token_for(b"user-42");
        let replicas = ring.replica_set(token, 3, &HashMap::new());
        assert_eq!(ring.primary(token), Some(&replicas[0]));
    }

    #[test]
    fn test_rack_aware_placement() {
        let ring = ring_of(&["a1", "a2", "b1", "b2"], 16);
        let racks: HashMap<NodeId, String> = [
            ("a1", "rack-a"),
            ("a2", "rack-a"),
            ("b1", "rack-b"),
            ("b2", "rack-b"),
        ]
        .into_iter()
        .map(|(n, r)| (NodeId::new(n), r.to_string()))
        .collect();

        for i in 0..100 {
            let replicas = ring.replicas_for_key(format!("k{}", i).as_bytes(), 2, &racks);
            let used: HashSet<&String> = replicas.iter().map(|n| &racks[n]).collect();
            assert_eq!(used.len(), 2, "replicas {:?} share a rack", replicas);
        }

        // more replicas than racks: deferred nodes fill in
        let replicas = ring.replicas_for_key(b"k", 3, &racks);
        assert_eq!(replicas.len(), 3);
    }

    #[test]
    fn test_token_collision_resolved_by_node_id() {
        let mut ring = TokenRing::new();
        ring.add_node(NodeId::new("b"), vec![Token(10)]);
        ring.add_node(NodeId::new("a"), vec![Token(10), Token(20)]);
        assert_eq!(ring.primary(Token(5)), Some(&NodeId::new("a")));

        ring.remove_node(&NodeId::new("a"));
        assert_eq!(ring.primary(Token(5)), Some(&NodeId::new("b")));
    }

    #[test]
    fn test_ownership_sums_to_one() {
        let ring = ring_of(&["a", "b", "c", "d"], 64);
        let total: f64 = ring.ownership().values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        for share in ring.ownership().values() {
            assert!(*share > 0.08 && *share < 0.5, "share {}", share);
        }
    }
}
