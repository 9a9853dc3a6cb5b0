//! Size-tiered compaction
//!
//! Tables of similar size are grouped into buckets; once a bucket holds
//! `compaction_threshold` tables they are merged into one. The merge is a
//! k-way merge over the tables' sorted scans, so memory use is one
//! partition per input.

use crate::common::{Error, Partition, Result};
use crate::storage::engine::StorageEngine;
use crate::storage::sstable::{SsTable, SsTableScanner};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Outcome of one compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub inputs: Vec<u64>,
    pub output: Option<u64>,
    pub partitions_written: u64,
    pub partitions_purged: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Group tables into size tiers. Each returned bucket is sorted by id and
/// holds at least `min_threshold` tables; the biggest bucket comes first.
pub fn size_tiered_buckets(tables: &[(u64, u64)], min_threshold: usize) -> Vec<Vec<u64>> {
    let mut by_size: Vec<(u64, u64)> = tables.to_vec();
    by_size.sort_by_key(|(id, size)| (*size, *id));

    // (average size, members)
    let mut buckets: Vec<(f64, Vec<(u64, u64)>)> = Vec::new();
    for (id, size) in by_size {
        let fits = buckets.iter_mut().find(|(avg, _)| {
            let s = size as f64;
            s >= avg * 0.5 && s <= avg * 1.5
        });
        match fits {
            Some((avg, members)) => {
                members.push((id, size));
                *avg = members.iter().map(|(_, s)| *s as f64).sum::<f64>() / members.len() as f64;
            }
            None => buckets.push((size as f64, vec![(id, size)])),
        }
    }

    let mut ready: Vec<Vec<u64>> = buckets
        .into_iter()
        .filter(|(_, members)| members.len() >= min_threshold)
        .map(|(_, members)| {
            let mut ids: Vec<u64> = members.into_iter().map(|(id, _)| id).collect();
            ids.sort_unstable();
            ids
        })
        .collect();
    ready.sort_by_key(|ids| Reverse(ids.len()));
    ready
}

/// K-way merge of sorted table scans, yielding one merged partition per key.
pub struct MergingScanner {
    scanners: Vec<SsTableScanner>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
    pending: Vec<Option<Partition>>,
    failed: bool,
}

impl MergingScanner {
    pub fn new(tables: &[Arc<SsTable>]) -> Result<Self> {
        let scanners = tables
            .iter()
            .map(|t| t.scan())
            .collect::<Result<Vec<_>>>()?;
        let mut merger = Self {
            pending: (0..scanners.len()).map(|_| None).collect(),
            scanners,
            heap: BinaryHeap::new(),
            failed: false,
        };
        for idx in 0..merger.scanners.len() {
            merger.advance(idx)?;
        }
        Ok(merger)
    }

    fn advance(&mut self, idx: usize) -> Result<()> {
        match self.scanners[idx].next() {
            Some(Ok(partition)) => {
                self.heap.push(Reverse((partition.key.clone(), idx)));
                self.pending[idx] = Some(partition);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn next_merged(&mut self) -> Result<Option<Partition>> {
        let Some(Reverse((key, idx))) = self.heap.pop() else {
            return Ok(None);
        };
        let mut versions = Vec::new();
        versions.extend(self.pending[idx].take());
        self.advance(idx)?;

        while let Some(Reverse((next_key, _))) = self.heap.peek() {
            if *next_key != key {
                break;
            }
            let Some(Reverse((_, other))) = self.heap.pop() else {
                break;
            };
            versions.extend(self.pending[other].take());
            self.advance(other)?;
        }

        Partition::merge_all(versions)
            .map(Some)
            .ok_or_else(|| Error::Internal("merge produced no partition".into()))
    }
}

impl Iterator for MergingScanner {
    type Item = Result<Partition>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_merged() {
            Ok(Some(partition)) => Some(Ok(partition)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Background compaction task.
pub struct CompactionManager {
    engine: Arc<StorageEngine>,
    interval: Duration,
    retries: usize,
}

impl CompactionManager {
    pub fn new(engine: Arc<StorageEngine>, interval: Duration, retries: usize) -> Self {
        Self {
            engine,
            interval,
            retries: retries.max(1),
        }
    }

    /// Run until aborted: every interval, compact buckets until none is ready.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    async fn run_once(&self) {
        loop {
            let engine = self.engine.clone();
            let result = crate::common::utils::retry_with_backoff(
                || {
                    let engine = engine.clone();
                    async move { tokio::task::spawn_blocking(move || engine.compact()).await? }
                },
                self.retries,
                Duration::from_millis(100),
            )
            .await;

            match result {
                Ok(Some(report)) => {
                    tracing::info!(
                        "Compacted sstables {:?} into {:?}: {} partitions, {} purged",
                        report.inputs,
                        report.output,
                        report.partitions_written,
                        report.partitions_purged
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Compaction failed: {}", e);
                    break;
                }
            }
        }
    }
}
