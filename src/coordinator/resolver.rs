//! Consistency resolver
//!
//! Merges the versions returned by replicas with the data-model rules and
//! works out, per replica, the fragment it is missing. Sending those
//! fragments is the coordinator's job.

use crate::common::{NodeId, Partition};

/// One replica's answer to a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaResponse {
    pub node: NodeId,
    pub data: Option<Partition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Winning version, tombstones included
    pub resolved: Option<Partition>,
    /// Stale replicas and the fragment that brings each up to date
    pub repairs: Vec<(NodeId, Partition)>,
}

impl Resolution {
    pub fn is_consistent(&self) -> bool {
        self.repairs.is_empty()
    }
}

pub fn resolve(responses: &[ReplicaResponse]) -> Resolution {
    let resolved =
        Partition::merge_all(responses.iter().filter_map(|r| r.data.clone()));
    let Some(winner) = &resolved else {
        return Resolution::default();
    };

    let repairs = responses
        .iter()
        .filter_map(|r| {
            winner
                .diff(r.data.as_ref())
                .map(|patch| (r.node.clone(), patch))
        })
        .collect();

    Resolution { resolved, repairs }
}
