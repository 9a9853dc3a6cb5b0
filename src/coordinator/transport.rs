//! Peer transport seam
//!
//! The coordinator and gossip talk to other nodes only through
//! [`PeerTransport`]; a node answers through [`PeerHandler`]. The wire
//! encoding is the transport's business. [`LocalNetwork`] connects nodes
//! living in one process, encoding every message with bincode on the way
//! through, and can cut nodes off to simulate failures.

use crate::common::{Error, NodeId, Result};
use crate::node::rpc::{PeerRequest, PeerResponse};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Outbound side: deliver a request to a peer and wait for its answer.
pub trait PeerTransport: Send + Sync {
    fn send(&self, target: &NodeId, request: PeerRequest) -> BoxFuture<'static, Result<PeerResponse>>;
}

/// Inbound side: a node's handler for peer requests. Failures are encoded
/// in the response so every transport treats answers uniformly.
pub trait PeerHandler: Send + Sync {
    fn handle(self: Arc<Self>, from: NodeId, request: PeerRequest) -> BoxFuture<'static, PeerResponse>;
}

/// In-process network of nodes.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<HashMap<NodeId, Weak<dyn PeerHandler>>>,
    down: RwLock<HashSet<NodeId>>,
    latency: RwLock<HashMap<NodeId, Duration>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route requests for `node` to `handler`. Only a weak reference is
    /// kept, so dropping the node takes it off the network.
    pub fn register(&self, node: NodeId, handler: Arc<dyn PeerHandler>) {
        self.handlers.write().insert(node, Arc::downgrade(&handler));
    }

    pub fn unregister(&self, node: &NodeId) {
        self.handlers.write().remove(node);
    }

    /// Transport used by `node` for its outgoing requests.
    pub fn transport_for(self: &Arc<Self>, node: NodeId) -> Arc<dyn PeerTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            from: node,
        })
    }

    /// Cut a node off (or reconnect it). A down node neither sends nor
    /// receives; its requests fail with `ConnectionFailed`.
    pub fn set_down(&self, node: &NodeId, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
        tracing::debug!("Network: {} is {}", node, if down { "down" } else { "up" });
    }

    pub fn is_down(&self, node: &NodeId) -> bool {
        self.down.read().contains(node)
    }

    /// Delay every request delivered to `node`.
    pub fn set_latency(&self, node: &NodeId, latency: Option<Duration>) {
        let mut map = self.latency.write();
        match latency {
            Some(d) => map.insert(node.clone(), d),
            None => map.remove(node),
        };
    }

    fn handler(&self, node: &NodeId) -> Option<Arc<dyn PeerHandler>> {
        self.handlers.read().get(node).and_then(Weak::upgrade)
    }

    fn latency_of(&self, node: &NodeId) -> Option<Duration> {
        self.latency.read().get(node).copied()
    }
}

struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: NodeId,
}

impl PeerTransport for LocalTransport {
    fn send(&self, target: &NodeId, request: PeerRequest) -> BoxFuture<'static, Result<PeerResponse>> {
        let network = self.network.clone();
        let from = self.from.clone();
        let target = target.clone();
        Box::pin(async move {
            let unreachable = || Error::ConnectionFailed(format!("{} -> {} unreachable", from, target));
            if network.is_down(&from) || network.is_down(&target) {
                return Err(unreachable());
            }
            let handler = network.handler(&target).ok_or_else(unreachable)?;

            let request: PeerRequest = bincode::deserialize(&bincode::serialize(&request)?)?;
            if let Some(delay) = network.latency_of(&target) {
                tokio::time::sleep(delay).await;
            }
            let response = handler.handle(from.clone(), request).await;

            // a node cut off mid-request never answers
            if network.is_down(&target) || network.is_down(&from) {
                return Err(unreachable());
            }
            Ok(bincode::deserialize(&bincode::serialize(&response)?)?)
        })
    }
}
