//! Major compaction of one node

use crate::common::{format_bytes, Result};
use crate::storage::StorageEngine;
use std::sync::Arc;

/// Flush, then merge every sstable of the node into one, purging
/// tombstones past their grace period.
pub async fn compact_node(engine: &Arc<StorageEngine>) -> Result<CompactReport> {
    tracing::info!("Starting major compaction");

    let engine = engine.clone();
    let report = tokio::task::spawn_blocking(move || -> Result<CompactReport> {
        engine.flush()?;
        let tables_before = engine.stats().sstables.len();
        let compaction = engine.major_compact()?;
        let tables_after = engine.stats().sstables.len();
        Ok(match compaction {
            Some(c) => CompactReport {
                tables_before,
                tables_after,
                partitions_written: c.partitions_written,
                partitions_purged: c.partitions_purged,
                bytes_freed: c.bytes_before.saturating_sub(c.bytes_after),
            },
            None => CompactReport {
                tables_before,
                tables_after,
                ..Default::default()
            },
        })
    })
    .await??;

    tracing::info!(
        "Compaction done: {} -> {} sstables, {} partitions purged, {} freed",
        report.tables_before,
        report.tables_after,
        report.partitions_purged,
        format_bytes(report.bytes_freed)
    );
    Ok(report)
}

#[derive(Debug, Default)]
pub struct CompactReport {
    pub tables_before: usize,
    pub tables_after: usize,
    pub partitions_written: u64,
    pub partitions_purged: u64,
    pub bytes_freed: u64,
}
