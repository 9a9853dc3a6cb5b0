//! Storage node
//!
//! Wires the storage engine, membership, hint store and coordinator of one
//! node together, exposes the client operations and answers peer requests.

use crate::cluster::Membership;
use crate::common::{
    timestamp_now_micros, timestamp_now_millis, Config, Error, NodeId, NodeMetrics, Partition,
    ReadCommand, Result, Row, Timestamp,
};
use crate::coordinator::{
    ConsistencyLevel, Coordinator, HintReplayReport, HintStore, PeerHandler, PeerTransport,
};
use crate::node::rpc::{PeerRequest, PeerResponse, ReplicaFailure};
use crate::storage::{CompactionManager, StorageEngine};
use futures_util::future::{join_all, BoxFuture};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub struct StorageNode {
    config: Config,
    engine: Arc<StorageEngine>,
    membership: Arc<Membership>,
    coordinator: Coordinator,
    transport: Arc<dyn PeerTransport>,
    metrics: Arc<NodeMetrics>,
}

impl StorageNode {
    /// Open the node's storage and join state. Nothing runs in the
    /// background until [`StorageNode::start`].
    pub fn open(config: Config, transport: Arc<dyn PeerTransport>) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(NodeMetrics::new());
        let engine = Arc::new(StorageEngine::open(&config, metrics.clone())?);
        let membership = Arc::new(Membership::new(
            &config,
            timestamp_now_millis(),
            metrics.clone(),
        ));
        let hints = Arc::new(HintStore::open(config.hints_dir())?);
        let coordinator = Coordinator::new(
            engine.clone(),
            membership.clone(),
            transport.clone(),
            hints,
            config.replication.clone(),
            metrics.clone(),
        );

        tracing::info!(
            "Node {} ready (rf={}, vnodes={}, seeds={:?})",
            config.node_id,
            config.cluster.replication_factor,
            config.cluster.num_vnodes,
            config.cluster.seeds
        );

        Ok(Arc::new(Self {
            config,
            engine,
            membership,
            coordinator,
            transport,
            metrics,
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// Write columns of one row. `timestamp` defaults to the wall clock.
    pub async fn put<I, N, V>(
        &self,
        partition_key: impl Into<Vec<u8>>,
        clustering_key: impl Into<Vec<u8>>,
        columns: I,
        timestamp: Option<Timestamp>,
        level: ConsistencyLevel,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<Vec<u8>>,
    {
        let timestamp = timestamp.unwrap_or_else(timestamp_now_micros);
        let mutation = Partition::upsert(partition_key, clustering_key, columns, timestamp);
        if mutation.rows.values().all(|row| row.cells.is_empty()) {
            return Err(Error::InvalidRequest("put needs at least one column".into()));
        }
        self.coordinator.write(mutation, level).await
    }

    /// Visible rows of a partition, or of one row when `clustering_key` is
    /// given. `NotFound` when nothing is visible.
    pub async fn get(
        &self,
        partition_key: impl Into<Vec<u8>>,
        clustering_key: Option<Vec<u8>>,
        level: ConsistencyLevel,
    ) -> Result<Vec<Row>> {
        let command = ReadCommand {
            partition_key: partition_key.into(),
            clustering: clustering_key,
            columns: None,
        };
        let key = String::from_utf8_lossy(&command.partition_key).into_owned();
        let rows = self
            .coordinator
            .read(command, level)
            .await?
            .map(|p| p.live_rows())
            .unwrap_or_default();
        if rows.is_empty() {
            return Err(Error::NotFound(key));
        }
        Ok(rows)
    }

    /// Write a tombstone through the normal write path.
    ///
    /// Named columns delete just those columns (of the row `clustering_key`,
    /// or the partition's unclustered row); a clustering key alone deletes
    /// that row; neither deletes the whole partition.
    pub async fn delete<I, N>(
        &self,
        partition_key: impl Into<Vec<u8>>,
        clustering_key: Option<Vec<u8>>,
        columns: I,
        timestamp: Option<Timestamp>,
        level: ConsistencyLevel,
    ) -> Result<()>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let timestamp = timestamp.unwrap_or_else(timestamp_now_micros);
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mutation = match (clustering_key, columns.is_empty()) {
            (ck, false) => {
                Partition::column_deletion(partition_key, ck.unwrap_or_default(), columns, timestamp)
            }
            (Some(ck), true) => Partition::row_deletion(partition_key, ck, timestamp),
            (None, true) => Partition::partition_deletion(partition_key, timestamp),
        };
        self.coordinator.write(mutation, level).await
    }

    /// One gossip round: exchange digests with the chosen peers. Returns
    /// how many exchanges succeeded.
    pub async fn gossip_round(&self) -> usize {
        let (digest, targets) = {
            let mut rng = rand::thread_rng();
            self.membership.start_round(&mut rng, Instant::now())
        };

        let timeout = self.config.replication.request_timeout;
        let exchanges = targets.into_iter().map(|target| {
            let request = PeerRequest::GossipExchange {
                digest: digest.clone(),
            };
            let sent = self.transport.send(&target, request);
            async move { (target, tokio::time::timeout(timeout, sent).await) }
        });

        let mut succeeded = 0;
        for (target, result) in join_all(exchanges).await {
            match result {
                Ok(Ok(PeerResponse::Digest(remote))) => {
                    self.membership.apply(&remote, Instant::now());
                    succeeded += 1;
                }
                Ok(Ok(other)) => {
                    tracing::warn!("Unexpected gossip reply from {}: {:?}", target, other);
                }
                Ok(Err(e)) => tracing::debug!("Gossip with {} failed: {}", target, e),
                Err(_) => tracing::debug!("Gossip with {} timed out", target),
            }
        }
        succeeded
    }

    pub async fn replay_hints(&self) -> Result<HintReplayReport> {
        self.coordinator.replay_hints().await
    }

    /// Formally remove a dead peer from the ring.
    pub fn remove_peer(&self, node: &NodeId) -> bool {
        self.membership.remove_peer(node)
    }

    async fn apply_local(&self, mutation: Partition) -> PeerResponse {
        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || engine.write(mutation)).await {
            Ok(Ok(())) => PeerResponse::Ack,
            Ok(Err(e)) => PeerResponse::failed(&e),
            Err(e) => PeerResponse::failed(&Error::from(e)),
        }
    }

    /// `StaleRing` when the request was routed on another placement and
    /// this node does not replicate `key` under its own.
    fn check_routing(&self, key: &[u8], routed: Option<u64>) -> Option<PeerResponse> {
        let routed = routed?;
        let view = self.membership.view();
        if routed == view.topology || view.replicas_for(key).contains(self.id()) {
            return None;
        }
        Some(PeerResponse::StaleRing {
            routed,
            current: view.topology,
            digest: self.membership.digest(),
        })
    }

    async fn handle_request(&self, from: NodeId, request: PeerRequest) -> PeerResponse {
        tracing::trace!("{} request from {}", request.kind(), from);
        match request {
            PeerRequest::ReplicateWrite {
                mutation,
                ring_topology,
            } => {
                if let Some(stale) = self.check_routing(&mutation.key, ring_topology) {
                    return stale;
                }
                self.apply_local(mutation).await
            }
            PeerRequest::ReplicateRead {
                command,
                ring_topology,
            } => {
                if let Some(stale) = self.check_routing(&command.partition_key, ring_topology) {
                    return stale;
                }
                let engine = self.engine.clone();
                match tokio::task::spawn_blocking(move || engine.read(&command)).await {
                    Ok(Ok(data)) => PeerResponse::ReadResult(data),
                    Ok(Err(e)) => PeerResponse::failed(&e),
                    Err(e) => PeerResponse::failed(&Error::from(e)),
                }
            }
            PeerRequest::GossipExchange { digest } => {
                self.membership.apply(&digest, Instant::now());
                PeerResponse::Digest(self.membership.digest())
            }
            PeerRequest::HintDeliver { target, mutation } => {
                if target != *self.id() {
                    return PeerResponse::Failed(ReplicaFailure::Rejected(format!(
                        "hint for {} delivered to {}",
                        target,
                        self.id()
                    )));
                }
                self.apply_local(mutation).await
            }
        }
    }

    /// Spawn gossip, hint replay, flushing and compaction.
    pub fn start(self: &Arc<Self>) -> BackgroundTasks {
        let mut handles = Vec::new();

        handles.push(periodic(
            Arc::downgrade(self),
            self.config.cluster.gossip_interval,
            |node| async move {
                node.gossip_round().await;
            },
        ));

        handles.push(periodic(
            Arc::downgrade(self),
            self.config.replication.hint_replay_interval,
            |node| async move {
                if let Err(e) = node.replay_hints().await {
                    tracing::warn!("Hint replay failed: {}", e);
                }
            },
        ));

        handles.push(tokio::spawn(self.engine.clone().run_flusher()));
        handles.push(
            CompactionManager::new(
                self.engine.clone(),
                self.config.storage.compaction_interval,
                self.config.storage.flush_retries,
            )
            .start(),
        );

        tracing::info!("Node {} background tasks started", self.id());
        BackgroundTasks { handles }
    }

    /// Flush memtables and sync the commit log.
    pub fn shutdown(&self) -> Result<()> {
        self.engine.flush()?;
        self.engine.sync()?;
        tracing::info!("Node {} flushed and synced", self.id());
        Ok(())
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn hints(&self) -> &Arc<HintStore> {
        self.coordinator.hints()
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl PeerHandler for StorageNode {
    fn handle(self: Arc<Self>, from: NodeId, request: PeerRequest) -> BoxFuture<'static, PeerResponse> {
        Box::pin(async move { self.handle_request(from, request).await })
    }
}

/// Run `task` every `period` while the node is alive.
fn periodic<F, Fut>(node: Weak<StorageNode>, period: Duration, task: F) -> JoinHandle<()>
where
    F: Fn(Arc<StorageNode>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(node) = node.upgrade() else {
                break;
            };
            task(node).await;
        }
    })
}

/// Handles of a node's background loops; dropping them stops the loops.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
