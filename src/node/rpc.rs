//! Peer-to-peer messages
//!
//! These are the only contracts a node exposes to other nodes. Both enums
//! are serde types so any transport can carry them; the in-process
//! network round-trips them through bincode.

use crate::cluster::GossipDigest;
use crate::common::{Error, Mutation, NodeId, Partition, ReadCommand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Apply a mutation locally. `ring_topology` is the coordinator's
    /// placement fingerprint; `None` skips the staleness check (repairs,
    /// hint delivery).
    ReplicateWrite {
        mutation: Mutation,
        ring_topology: Option<u64>,
    },
    /// Read a slice of local data. `ring_topology` works as for writes.
    ReplicateRead {
        command: ReadCommand,
        ring_topology: Option<u64>,
    },
    GossipExchange {
        digest: GossipDigest,
    },
    /// A hint replayed on behalf of `target` (the receiver).
    HintDeliver {
        target: NodeId,
        mutation: Mutation,
    },
}

impl PeerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::ReplicateWrite { .. } => "replicate_write",
            PeerRequest::ReplicateRead { .. } => "replicate_read",
            PeerRequest::GossipExchange { .. } => "gossip_exchange",
            PeerRequest::HintDeliver { .. } => "hint_deliver",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    Ack,
    /// Raw replica data for the requested slice, tombstones included
    ReadResult(Option<Partition>),
    Digest(GossipDigest),
    /// The request was routed on a placement this replica disagrees with
    StaleRing {
        routed: u64,
        current: u64,
        digest: GossipDigest,
    },
    Failed(ReplicaFailure),
}

/// Why a replica could not serve a request. Keeps the kinds a coordinator
/// reports to its client distinct across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaFailure {
    Durability(String),
    Corruption { file: String, reason: String },
    Rejected(String),
    Internal(String),
}

impl From<&Error> for ReplicaFailure {
    fn from(e: &Error) -> Self {
        match e {
            Error::DurabilityFailure(reason) => ReplicaFailure::Durability(reason.clone()),
            Error::CorruptionDetected { file, reason } => ReplicaFailure::Corruption {
                file: file.clone(),
                reason: reason.clone(),
            },
            Error::ChecksumMismatch { .. } => ReplicaFailure::Corruption {
                file: "sstable".into(),
                reason: e.to_string(),
            },
            Error::InvalidRequest(reason) => ReplicaFailure::Rejected(reason.clone()),
            other => ReplicaFailure::Internal(other.to_string()),
        }
    }
}

impl From<ReplicaFailure> for Error {
    fn from(failure: ReplicaFailure) -> Self {
        match failure {
            ReplicaFailure::Durability(reason) => Error::DurabilityFailure(reason),
            ReplicaFailure::Corruption { file, reason } => Error::CorruptionDetected { file, reason },
            ReplicaFailure::Rejected(reason) => Error::InvalidRequest(reason),
            ReplicaFailure::Internal(reason) => Error::Internal(reason),
        }
    }
}

impl PeerResponse {
    pub fn failed(e: &Error) -> Self {
        PeerResponse::Failed(e.into())
    }

    /// Turn a non-`Ack` answer to a write into an error.
    pub fn into_ack(self) -> Result<(), Error> {
        match self {
            PeerResponse::Ack => Ok(()),
            PeerResponse::StaleRing {
                routed, current, ..
            } => Err(Error::StaleRingView { routed, current }),
            PeerResponse::Failed(failure) => Err(failure.into()),
            other => Err(Error::Internal(format!(
                "unexpected response to write: {:?}",
                other
            ))),
        }
    }

    pub fn into_read(self) -> Result<Option<Partition>, Error> {
        match self {
            PeerResponse::ReadResult(data) => Ok(data),
            PeerResponse::StaleRing {
                routed, current, ..
            } => Err(Error::StaleRingView { routed, current }),
            PeerResponse::Failed(failure) => Err(failure.into()),
            other => Err(Error::Internal(format!(
                "unexpected response to read: {:?}",
                other
            ))),
        }
    }
}
