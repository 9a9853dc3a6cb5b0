//! In-process cluster harness shared by the scenario tests

#![allow(dead_code)]

use ringkv::cluster::Liveness;
use ringkv::common::{Config, NodeId};
use ringkv::{LocalNetwork, StorageNode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<Arc<StorageNode>>,
    seeds: Vec<NodeId>,
    replication_factor: usize,
    tune: fn(&mut Config),
    dir: TempDir,
}

impl TestCluster {
    pub fn start(names: &[&str], replication_factor: usize) -> Self {
        Self::start_with(names, replication_factor, |_| {})
    }

    pub fn start_with(names: &[&str], replication_factor: usize, tune: fn(&mut Config)) -> Self {
        let mut cluster = Self {
            network: LocalNetwork::new(),
            nodes: Vec::new(),
            seeds: names.iter().take(2).map(|n| NodeId::new(*n)).collect(),
            replication_factor,
            tune,
            dir: TempDir::new().unwrap(),
        };
        for name in names {
            cluster.add_node(name);
        }
        cluster
    }

    /// Start another node using the same seeds. Gossip must run before the
    /// rest of the cluster learns about it.
    pub fn add_node(&mut self, name: &str) -> Arc<StorageNode> {
        let node = self.open_node(name);
        self.nodes.push(node.clone());
        node
    }

    /// Drop a node and reopen it from its data directory.
    pub async fn restart(&mut self, name: &str) -> Arc<StorageNode> {
        let index = self.index(name);
        let old = self.nodes.remove(index);
        self.network.unregister(old.id());
        drop(old);
        // let in-flight replica tasks release their handles
        tokio::time::sleep(Duration::from_millis(50)).await;
        let node = self.open_node(name);
        self.nodes.insert(index, node.clone());
        node
    }

    fn open_node(&self, name: &str) -> Arc<StorageNode> {
        let id = NodeId::new(name);
        let mut config = Config::for_node(name, self.dir.path().join(name));
        config.cluster.replication_factor = self.replication_factor;
        config.cluster.seeds = self.seeds.clone();
        config.cluster.gossip_fanout = 3;
        (self.tune)(&mut config);
        let node = StorageNode::open(config, self.network.transport_for(id.clone())).unwrap();
        self.network.register(id, node.clone());
        node
    }

    fn index(&self, name: &str) -> usize {
        self.nodes
            .iter()
            .position(|n| n.id().as_str() == name)
            .unwrap_or_else(|| panic!("no node {}", name))
    }

    pub fn node(&self, name: &str) -> &Arc<StorageNode> {
        &self.nodes[self.index(name)]
    }

    pub fn id(name: &str) -> NodeId {
        NodeId::new(name)
    }

    pub fn set_down(&self, name: &str, down: bool) {
        self.network.set_down(&NodeId::new(name), down);
    }

    pub async fn gossip(&self, rounds: usize) {
        for _ in 0..rounds {
            for node in &self.nodes {
                node.gossip_round().await;
            }
        }
    }

    /// Gossip until every node sees every other node alive.
    pub async fn converge(&self) {
        for _ in 0..50 {
            self.gossip(1).await;
            if self.converged() {
                return;
            }
        }
        panic!("cluster did not converge");
    }

    pub fn converged(&self) -> bool {
        let n = self.nodes.len();
        self.nodes.iter().all(|node| {
            let view = node.membership().view();
            view.ring().node_count() == n
                && self
                    .nodes
                    .iter()
                    .all(|peer| view.liveness(peer.id()) == Liveness::Alive)
        })
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
