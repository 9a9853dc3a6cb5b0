//! Replication coordinator
//!
//! Any node can coordinate any request. Writes and reads fan out to the
//! key's replicas in parallel and return as soon as the consistency level
//! is met. Replicas that have not answered keep running in the background:
//! late write failures become hints, late read responses feed read repair.
//!
//! A replica that disagrees with the coordinator's placement answers with
//! its own membership digest; the coordinator folds it in and retries the
//! whole operation once on the refreshed ring.

use crate::cluster::Membership;
use crate::common::utils::{retry_with_backoff, validate_partition_key};
use crate::common::{
    timestamp_now_millis, Error, Mutation, NodeId, NodeMetrics, Partition, ReadCommand,
    ReplicationConfig, Result,
};
use crate::coordinator::consistency::ConsistencyLevel;
use crate::coordinator::hints::HintStore;
use crate::coordinator::resolver::{resolve, ReplicaResponse};
use crate::coordinator::transport::PeerTransport;
use crate::node::rpc::{PeerRequest, PeerResponse};
use crate::storage::StorageEngine;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const REPAIR_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of one hint replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HintReplayReport {
    pub delivered: usize,
    pub dropped: usize,
    pub remaining: usize,
}

#[derive(Clone)]
pub struct Coordinator {
    local: NodeId,
    engine: Arc<StorageEngine>,
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    hints: Arc<HintStore>,
    config: ReplicationConfig,
    metrics: Arc<NodeMetrics>,
}

impl Coordinator {
    pub fn new(
        engine: Arc<StorageEngine>,
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        hints: Arc<HintStore>,
        config: ReplicationConfig,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            local: membership.local_id().clone(),
            engine,
            membership,
            transport,
            hints,
            config,
            metrics,
        }
    }

    /// Replicate a mutation at the requested consistency level.
    pub async fn write(&self, mutation: Mutation, level: ConsistencyLevel) -> Result<()> {
        validate_partition_key(&mutation.key)?;
        self.metrics.writes.inc();
        let start = Instant::now();

        let mut result = self.write_once(&mutation, level).await;
        if let Err(Error::StaleRingView { routed, current }) = &result {
            tracing::debug!(
                "Write routed on topology {:016x}, replica has {:016x}; retrying on refreshed ring",
                routed,
                current
            );
            self.metrics.stale_ring_retries.inc();
            result = self.write_once(&mutation, level).await;
        }

        self.metrics.write_latency.observe_duration(start.elapsed());
        if matches!(result, Err(Error::Unavailable { .. })) {
            self.metrics.unavailable.inc();
        }
        result
    }

    async fn write_once(&self, mutation: &Mutation, level: ConsistencyLevel) -> Result<()> {
        let view = self.membership.view();
        let replicas = view.replicas_for(&mutation.key);
        let required = level.required(view.replication_factor());
        let (dead, live): (Vec<NodeId>, Vec<NodeId>) =
            replicas.into_iter().partition(|n| view.is_dead(n));

        if live.len() < required {
            return Err(Error::Unavailable {
                needed: required,
                available: live.len(),
            });
        }

        let mut pending: FuturesUnordered<JoinHandle<(NodeId, Result<()>)>> = live
            .into_iter()
            .map(|target| {
                let this = self.clone();
                let mutation = mutation.clone();
                let topology = view.topology;
                tokio::spawn(async move {
                    let result = this.send_write(&target, mutation, Some(topology)).await;
                    (target, result)
                })
            })
            .collect();

        let mut acks = 0usize;
        let mut failed: Vec<NodeId> = Vec::new();
        let mut errors: Vec<Error> = Vec::new();
        while acks < required {
            let Some(joined) = pending.next().await else {
                break;
            };
            match joined? {
                (_, Ok(())) => acks += 1,
                (node, Err(e)) => {
                    tracing::debug!("Replica {} failed write: {}", node, e);
                    failed.push(node);
                    errors.push(e);
                }
            }
        }

        if acks < required {
            return Err(shortfall(required, acks, errors));
        }
        if !self.config.hinted_handoff {
            return Ok(());
        }

        // hints for replicas already known to have missed the write are
        // durable before the caller hears back
        failed.extend(dead);
        self.store_hints(failed, mutation.clone()).await;

        if !pending.is_empty() {
            let this = self.clone();
            let mutation = mutation.clone();
            tokio::spawn(async move {
                while let Some(joined) = pending.next().await {
                    if let Ok((node, Err(e))) = joined {
                        tracing::debug!("Replica {} failed write after quorum: {}", node, e);
                        this.store_hints(vec![node], mutation.clone()).await;
                    }
                }
            });
        }
        Ok(())
    }

    async fn store_hints(&self, targets: Vec<NodeId>, mutation: Mutation) {
        let targets: Vec<NodeId> = targets
            .into_iter()
            .filter(|t| *t != self.local)
            .collect();
        if targets.is_empty() {
            return;
        }
        let hints = self.hints.clone();
        let metrics = self.metrics.clone();
        let stored = tokio::task::spawn_blocking(move || {
            let now = timestamp_now_millis();
            for target in &targets {
                match hints.store(target, mutation.clone(), now) {
                    Ok(()) => {
                        metrics.hints_stored.inc();
                        tracing::debug!("Stored hint for {}", target);
                    }
                    Err(e) => tracing::warn!("Failed to store hint for {}: {}", target, e),
                }
            }
        })
        .await;
        if let Err(e) = stored {
            tracing::warn!("Hint storage task failed: {}", e);
        }
    }

    /// Apply a mutation on one replica, local or remote.
    async fn send_write(&self, target: &NodeId, mutation: Mutation, topology: Option<u64>) -> Result<()> {
        if *target == self.local {
            let engine = self.engine.clone();
            let write = tokio::task::spawn_blocking(move || engine.write(mutation));
            return self.with_timeout(target, "write", async { write.await? }).await;
        }

        let request = PeerRequest::ReplicateWrite {
            mutation,
            ring_topology: topology,
        };
        let response = self
            .with_timeout(target, "write", self.transport.send(target, request))
            .await?;
        self.absorb_stale(&response);
        response.into_ack()
    }

    /// Fold in the membership a replica sent along with a stale-ring answer.
    fn absorb_stale(&self, response: &PeerResponse) {
        if let PeerResponse::StaleRing { digest, .. } = response {
            self.membership.apply(digest, Instant::now());
        }
    }

    /// Read at the requested consistency level. Returns the resolved raw
    /// partition (tombstones included) or `None` when no replica holds it.
    pub async fn read(&self, command: ReadCommand, level: ConsistencyLevel) -> Result<Option<Partition>> {
        validate_partition_key(&command.partition_key)?;
        self.metrics.reads.inc();
        let start = Instant::now();

        let mut result = self.read_once(&command, level).await;
        if let Err(Error::StaleRingView { routed, current }) = &result {
            tracing::debug!(
                "Read routed on topology {:016x}, replica has {:016x}; retrying on refreshed ring",
                routed,
                current
            );
            self.metrics.stale_ring_retries.inc();
            result = self.read_once(&command, level).await;
        }

        self.metrics.read_latency.observe_duration(start.elapsed());
        if matches!(result, Err(Error::Unavailable { .. })) {
            self.metrics.unavailable.inc();
        }
        result
    }

    async fn read_once(&self, command: &ReadCommand, level: ConsistencyLevel) -> Result<Option<Partition>> {
        let view = self.membership.view();
        let required = level.required(view.replication_factor());
        let live: Vec<NodeId> = view
            .replicas_for(&command.partition_key)
            .into_iter()
            .filter(|n| !view.is_dead(n))
            .collect();
        if live.len() < required {
            return Err(Error::Unavailable {
                needed: required,
                available: live.len(),
            });
        }

        let mut pending: FuturesUnordered<JoinHandle<(NodeId, Result<Option<Partition>>)>> = live
            .into_iter()
            .map(|target| {
                let this = self.clone();
                let command = command.clone();
                let topology = view.topology;
                tokio::spawn(async move {
                    let result = this.send_read(&target, command, topology).await;
                    (target, result)
                })
            })
            .collect();

        let mut responses: Vec<ReplicaResponse> = Vec::new();
        let mut errors: Vec<Error> = Vec::new();
        while responses.len() < required {
            let Some(joined) = pending.next().await else {
                break;
            };
            match joined? {
                (node, Ok(data)) => responses.push(ReplicaResponse { node, data }),
                (node, Err(e)) => {
                    tracing::debug!("Replica {} failed read: {}", node, e);
                    errors.push(e);
                }
            }
        }
        if responses.len() < required {
            return Err(shortfall(required, responses.len(), errors));
        }

        let resolved = resolve(&responses).resolved;
        self.spawn_read_repair(responses, pending);
        Ok(resolved)
    }

    async fn send_read(
        &self,
        target: &NodeId,
        command: ReadCommand,
        topology: u64,
    ) -> Result<Option<Partition>> {
        if *target == self.local {
            let engine = self.engine.clone();
            let read = tokio::task::spawn_blocking(move || engine.read(&command));
            return self.with_timeout(target, "read", async { read.await? }).await;
        }
        let request = PeerRequest::ReplicateRead {
            command,
            ring_topology: Some(topology),
        };
        let response = self
            .with_timeout(target, "read", self.transport.send(target, request))
            .await?;
        self.absorb_stale(&response);
        response.into_read()
    }

    /// Best-effort background repair: wait up to the grace period for the
    /// remaining replicas, resolve everything received and push each stale
    /// replica the fragment it is missing.
    fn spawn_read_repair(
        &self,
        mut responses: Vec<ReplicaResponse>,
        mut pending: FuturesUnordered<JoinHandle<(NodeId, Result<Option<Partition>>)>>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + this.config.read_repair_grace;
            while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, pending.next()).await {
                if let Ok((node, Ok(data))) = joined {
                    responses.push(ReplicaResponse { node, data });
                }
            }

            let resolution = resolve(&responses);
            for (node, patch) in resolution.repairs {
                let attempt = retry_with_backoff(
                    || this.send_write(&node, patch.clone(), None),
                    this.config.read_repair_attempts.max(1),
                    REPAIR_BACKOFF,
                )
                .await;
                match attempt {
                    Ok(()) => {
                        this.metrics.read_repairs.inc();
                        tracing::debug!("Read repair sent to {}", node);
                    }
                    Err(e) => {
                        this.metrics.read_repair_failures.inc();
                        tracing::warn!("Read repair to {} failed: {}", node, e);
                    }
                }
            }
        });
    }

    /// Deliver stored hints to replicas that are alive again and drop
    /// hints past the retention window.
    pub async fn replay_hints(&self) -> Result<HintReplayReport> {
        let mut report = HintReplayReport::default();

        let retention = u64::try_from(self.config.hint_retention.as_millis()).unwrap_or(u64::MAX);
        let cutoff = timestamp_now_millis().saturating_sub(retention);
        let hints = self.hints.clone();
        let dropped = tokio::task::spawn_blocking(move || hints.expire(cutoff)).await??;
        if !dropped.is_empty() {
            let targets: HashSet<&NodeId> = dropped.iter().map(|h| &h.target).collect();
            tracing::warn!(
                "Dropped {} expired hint(s) for {:?}; those replicas need a full repair",
                dropped.len(),
                targets
            );
            self.metrics.hints_dropped.add(dropped.len() as u64);
            report.dropped = dropped.len();
        }

        let view = self.membership.view();
        for target in self.hints.targets() {
            if !view.is_alive(&target) {
                continue;
            }
            let mut delivered = HashSet::new();
            for hint in self.hints.pending(&target) {
                let request = PeerRequest::HintDeliver {
                    target: target.clone(),
                    mutation: hint.mutation,
                };
                let sent = self
                    .with_timeout(&target, "hint", self.transport.send(&target, request))
                    .await
                    .and_then(PeerResponse::into_ack);
                match sent {
                    Ok(()) => {
                        delivered.insert(hint.id);
                    }
                    Err(e) => {
                        tracing::warn!("Hint delivery to {} failed, retrying next cycle: {}", target, e);
                        break;
                    }
                }
            }
            if !delivered.is_empty() {
                tracing::info!("Delivered {} hint(s) to {}", delivered.len(), target);
                self.metrics.hints_delivered.add(delivered.len() as u64);
                report.delivered += delivered.len();
                let hints = self.hints.clone();
                let target = target.clone();
                tokio::task::spawn_blocking(move || hints.remove(&target, &delivered)).await??;
            }
        }

        report.remaining = self.hints.count();
        Ok(report)
    }

    /// Push one partition to a replica, bypassing the consistency
    /// machinery. Used by anti-entropy repair.
    pub async fn push_to(&self, target: &NodeId, partition: Partition) -> Result<()> {
        self.send_write(target, partition, None).await
    }

    async fn with_timeout<T, F>(&self, target: &NodeId, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.timeouts.inc();
                Err(Error::Timeout(format!("{} to {}", what, target)))
            }
        }
    }

    pub fn hints(&self) -> &Arc<HintStore> {
        &self.hints
    }
}

/// The error for an operation that got `answered` of `required` replies.
/// A stale placement wins so the caller can retry. Replica faults are
/// reported as such when every failed replica did answer; any unreachable
/// replica makes the operation `Unavailable`.
fn shortfall(required: usize, answered: usize, mut errors: Vec<Error>) -> Error {
    if let Some(pos) = errors
        .iter()
        .position(|e| matches!(e, Error::StaleRingView { .. }))
    {
        return errors.swap_remove(pos);
    }
    if !errors.iter().any(Error::is_unreachable) {
        let fault = errors
            .into_iter()
            .filter(|e| matches!(e, Error::DurabilityFailure(_)) || e.is_corruption())
            .min_by_key(|e| !matches!(e, Error::DurabilityFailure(_)));
        if let Some(e) = fault {
            return e;
        }
    }
    Error::Unavailable {
        needed: required,
        available: answered,
    }
}
