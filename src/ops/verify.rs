//! Verify sstable integrity

use crate::common::Result;
use crate::storage::{EngineVerifyReport, StorageEngine};
use std::sync::Arc;

/// Checksum every sstable of the node. Corrupt tables are quarantined
/// and listed in the report; the node keeps serving from the rest.
pub async fn verify_node(engine: &Arc<StorageEngine>) -> Result<EngineVerifyReport> {
    tracing::info!("Starting verification");

    let engine = engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.verify()).await?;

    if report.quarantined.is_empty() {
        tracing::info!(
            "Verified {} sstables ({} partitions)",
            report.tables_checked,
            report.partitions_checked
        );
    } else {
        tracing::error!(
            "Verification quarantined {} of {} sstables: {:?}",
            report.quarantined.len(),
            report.tables_checked,
            report.quarantined
        );
    }
    Ok(report)
}
