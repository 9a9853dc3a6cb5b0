//! Anti-entropy repair
//!
//! Pushes every partition held locally to its current replicas. This is
//! the fallback for replicas that were down longer than hints are kept.

use crate::common::{ReadCommand, Result};
use crate::node::StorageNode;

pub async fn repair_node(node: &StorageNode, dry_run: bool) -> Result<RepairReport> {
    tracing::info!("Starting repair of {} (dry_run={})", node.id(), dry_run);

    let view = node.membership().view();
    let engine = node.engine().clone();
    let keys = tokio::task::spawn_blocking(move || engine.partition_keys()).await?;

    let mut report = RepairReport::default();
    for key in keys {
        report.partitions_checked += 1;

        let engine = node.engine().clone();
        let command = ReadCommand::partition(key.clone());
        let Some(partition) = tokio::task::spawn_blocking(move || engine.read(&command)).await??
        else {
            continue;
        };

        for replica in view.replicas_for(&key) {
            if replica == *node.id() {
                continue;
            }
            if !view.is_alive(&replica) {
                report.skipped += 1;
                continue;
            }
            if dry_run {
                report.pushed += 1;
                continue;
            }
            match node.coordinator().push_to(&replica, partition.clone()).await {
                Ok(()) => report.pushed += 1,
                Err(e) => {
                    tracing::warn!("Repair push to {} failed: {}", replica, e);
                    report.failed += 1;
                }
            }
        }
    }

    tracing::info!(
        "Repair done: {} partitions, {} pushes, {} failed, {} skipped",
        report.partitions_checked,
        report.pushed,
        report.failed,
        report.skipped
    );
    Ok(report)
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub partitions_checked: usize,
    pub pushed: usize,
    pub failed: usize,
    /// Replica pushes skipped because the replica is not alive
    pub skipped: usize,
}
