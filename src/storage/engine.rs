//! LSM storage engine
//!
//! Write path: commit log append, then memtable merge. A full memtable is
//! frozen (the commit log rotates with it) and flushed to an sstable by a
//! background task while writes continue against a fresh memtable.
//!
//! Read path: active memtable, frozen memtables, then sstables newest to
//! oldest, skipping tables whose membership filter rules the key out. All
//! versions found are merged with the data-model rules.
//!
//! Locking: `state` guards which memtables and sstables are live. Writers
//! hold its read side for the commit log append plus the memtable merge,
//! so a freeze (write side) never strands an appended mutation in the old
//! memtable's segment range. Flush and compaction only take the write
//! side to swap their results in. The commit log mutex is the single
//! ordering point for appends.

use crate::common::utils::{retry_with_backoff, validate_partition_key};
use crate::common::{
    timestamp_now_millis, Config, Error, LocalTime, Mutation, NodeMetrics, Partition,
    ReadCommand, Result, StorageConfig,
};
use crate::storage::commitlog::{list_segments, CommitLog};
use crate::storage::compaction::{size_tiered_buckets, CompactionReport, MergingScanner};
use crate::storage::filter::FilterKind;
use crate::storage::manifest::Manifest;
use crate::storage::memtable::Memtable;
use crate::storage::sstable::{table_path, write_sstable, SsTable, SsTableMeta};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct EngineState {
    active: Arc<Memtable>,
    /// Frozen memtables waiting for flush, oldest first
    immutables: Vec<Arc<Memtable>>,
    /// Live sstables, sorted by id (oldest first)
    sstables: Vec<Arc<SsTable>>,
}

/// Point-in-time view for operators.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub memtable_bytes: usize,
    pub memtable_partitions: usize,
    pub frozen_memtables: usize,
    pub commitlog_segment: u64,
    pub sstables: Vec<SsTableMeta>,
}

/// Result of a full checksum scan.
#[derive(Debug, Clone, Default)]
pub struct EngineVerifyReport {
    pub tables_checked: usize,
    pub partitions_checked: u64,
    pub quarantined: Vec<u64>,
}

pub struct StorageEngine {
    config: StorageConfig,
    sstable_dir: PathBuf,
    quarantine_dir: PathBuf,
    commitlog: Mutex<CommitLog>,
    state: RwLock<EngineState>,
    manifest: Mutex<Manifest>,
    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    flush_needed: Notify,
    metrics: Arc<NodeMetrics>,
}

impl StorageEngine {
    /// Open the engine under `config.data_dir`, recovering from the
    /// manifest and replaying the commit log.
    pub fn open(config: &Config, metrics: Arc<NodeMetrics>) -> Result<Self> {
        let storage = config.storage.clone();
        let sstable_dir = config.sstable_dir();
        let quarantine_dir = config.quarantine_dir();
        let commitlog_dir = config.commitlog_dir();
        std::fs::create_dir_all(&sstable_dir)?;
        std::fs::create_dir_all(&quarantine_dir)?;
        std::fs::create_dir_all(&commitlog_dir)?;

        let mut manifest = Manifest::load_or_create(&sstable_dir)?;
        manifest.remove_orphans(&sstable_dir)?;

        let mut sstables = Vec::new();
        let mut lost = Vec::new();
        for &id in &manifest.sstables {
            let path = table_path(&sstable_dir, id);
            match SsTable::open(&path, id) {
                Ok(table) => sstables.push(Arc::new(table)),
                Err(e) if e.is_corruption() => {
                    tracing::error!("SSTable {} failed to open: {}; quarantining", id, e);
                    move_to_quarantine(&path, &quarantine_dir);
                    metrics.sstables_quarantined.inc();
                    lost.push(id);
                }
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::error!("SSTable {} listed in manifest is missing", id);
                    lost.push(id);
                }
                Err(e) => return Err(e),
            }
        }
        if !lost.is_empty() {
            for id in &lost {
                manifest.remove(*id);
            }
            manifest.persist(&sstable_dir)?;
        }

        let low_water = manifest.commitlog_low_water;
        for (id, path) in list_segments(&commitlog_dir)? {
            if id < low_water {
                std::fs::remove_file(&path)?;
            }
        }

        let memtable = Memtable::new(low_water);
        let replay = CommitLog::replay(&commitlog_dir, low_water, |entry| {
            memtable.apply(entry.mutation);
            Ok(())
        })?;
        let commitlog = CommitLog::open(
            &commitlog_dir,
            storage.commitlog_segment_size,
            storage.commitlog_sync,
        )?;

        tracing::info!(
            "Storage engine opened at {}: {} sstable(s), replayed {} mutation(s) from {} segment(s)",
            config.data_dir.display(),
            sstables.len(),
            replay.entries,
            replay.segments
        );
        if replay.torn_segments > 0 {
            tracing::warn!(
                "{} commit log segment(s) ended in a torn record",
                replay.torn_segments
            );
        }
        metrics.live_sstables.set(sstables.len() as u64);

        Ok(Self {
            config: storage,
            sstable_dir,
            quarantine_dir,
            commitlog: Mutex::new(commitlog),
            state: RwLock::new(EngineState {
                active: Arc::new(memtable),
                immutables: Vec::new(),
                sstables,
            }),
            manifest: Mutex::new(manifest),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            flush_needed: Notify::new(),
            metrics,
        })
    }

    /// Apply a mutation durably. A commit log failure is returned as
    /// `DurabilityFailure` and the memtable is left untouched.
    ///
    /// Tombstones are stamped with this node's clock before they are
    /// logged, so replay keeps their original local deletion time.
    pub fn write(&self, mut mutation: Mutation) -> Result<()> {
        validate_partition_key(&mutation.key)?;
        mutation.stamp_deletions(timestamp_now_millis() as LocalTime);

        let full = {
            let state = self.state.read();
            self.commitlog.lock().append(&mutation).map_err(|e| {
                tracing::error!("Commit log append failed: {}", e);
                Error::DurabilityFailure(e.to_string())
            })?;
            self.metrics.commitlog_appends.inc();
            state.active.apply(mutation);
            state.active.size_bytes() >= self.config.memtable_flush_threshold
        };

        if full {
            // the write itself is already durable
            if let Err(e) = self.freeze(true) {
                tracing::warn!("Memtable freeze failed: {}", e);
            }
        }
        Ok(())
    }

    /// Swap in a fresh memtable and queue the old one for flushing.
    fn freeze(&self, only_if_full: bool) -> Result<bool> {
        let mut state = self.state.write();
        if state.active.is_empty()
            || (only_if_full && state.active.size_bytes() < self.config.memtable_flush_threshold)
        {
            return Ok(false);
        }

        let segment = self.commitlog.lock().rotate()?;
        let frozen = std::mem::replace(&mut state.active, Arc::new(Memtable::new(segment)));
        tracing::debug!(
            "Froze memtable with {} partition(s), {} bytes",
            frozen.len(),
            frozen.size_bytes()
        );
        state.immutables.push(frozen);
        drop(state);

        self.flush_needed.notify_one();
        Ok(true)
    }

    /// Freeze the active memtable and flush everything frozen.
    pub fn flush(&self) -> Result<usize> {
        self.freeze(false)?;
        self.flush_frozen()
    }

    /// Flush frozen memtables, oldest first. Returns how many were flushed.
    pub fn flush_frozen(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock();
        let mut flushed = 0;
        loop {
            let next = self.state.read().immutables.first().cloned();
            let Some(memtable) = next else {
                break;
            };
            self.flush_memtable(&memtable)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    fn flush_memtable(&self, memtable: &Arc<Memtable>) -> Result<()> {
        let id = self.manifest.lock().allocate_id();
        let table = write_sstable(
            &self.sstable_dir,
            id,
            memtable.snapshot().into_iter().map(Ok),
            memtable.len(),
            FilterKind::Bloom,
            self.config.bloom_fp_rate,
        )?;

        // segments before the next unflushed memtable are now redundant
        let low_water = {
            let state = self.state.read();
            state
                .immutables
                .iter()
                .find(|m| !Arc::ptr_eq(m, memtable))
                .unwrap_or(&state.active)
                .first_segment()
        };

        {
            let mut manifest = self.manifest.lock();
            let mut next = manifest.clone();
            match &table {
                Some(t) => next.add_flushed(t.id(), low_water),
                None => {
                    next.commitlog_low_water = next.commitlog_low_water.max(low_water);
                    next.version += 1;
                }
            }
            if let Err(e) = next.persist(&self.sstable_dir) {
                if let Some(t) = &table {
                    t.mark_obsolete();
                }
                return Err(e);
            }
            *manifest = next;
        }

        let table_id = table.as_ref().map(|t| t.id());
        {
            let mut state = self.state.write();
            state.immutables.retain(|m| !Arc::ptr_eq(m, memtable));
            if let Some(t) = table {
                state.sstables.push(Arc::new(t));
            }
            self.metrics.live_sstables.set(state.sstables.len() as u64);
        }
        self.metrics.memtable_flushes.inc();

        if let Err(e) = self.commitlog.lock().delete_segments_below(low_water) {
            tracing::warn!("Failed to delete flushed commit log segments: {}", e);
        }
        tracing::info!(
            "Flushed memtable ({} partition(s)) to sstable {:?}",
            memtable.len(),
            table_id
        );
        Ok(())
    }

    /// Background flusher: waits for freezes and flushes with backoff.
    pub async fn run_flusher(self: Arc<Self>) {
        let retries = self.config.flush_retries.max(1);
        loop {
            self.flush_needed.notified().await;
            let result = retry_with_backoff(
                || {
                    let engine = self.clone();
                    async move { tokio::task::spawn_blocking(move || engine.flush_frozen()).await? }
                },
                retries,
                Duration::from_millis(100),
            )
            .await;
            if let Err(e) = result {
                tracing::error!(
                    "Memtable flush failed: {}; commit log keeps the data until the next attempt",
                    e
                );
            }
        }
    }

    /// Raw read: every version of the selected slice merged, tombstones
    /// included, so coordinators can reconcile replicas.
    pub fn read(&self, command: &ReadCommand) -> Result<Option<Partition>> {
        let key = command.partition_key.as_slice();
        let (memtables, sstables) = {
            let state = self.state.read();
            let mut memtables = Vec::with_capacity(1 + state.immutables.len());
            memtables.push(state.active.clone());
            memtables.extend(state.immutables.iter().rev().cloned());
            (memtables, state.sstables.clone())
        };

        let mut versions: Vec<Partition> = memtables.iter().filter_map(|m| m.get(key)).collect();
        for table in sstables.iter().rev() {
            if !table.may_contain(key) {
                self.metrics.filter_skips.inc();
                continue;
            }
            match table.get(key) {
                Ok(Some(partition)) => versions.push(partition),
                Ok(None) => {}
                Err(e) if e.is_corruption() => self.quarantine(table, &e),
                // quarantined by a concurrent reader
                Err(_) if table.is_retired() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(Partition::merge_all(versions)
            .map(|p| p.slice(command.clustering.as_deref(), command.columns.as_deref()))
            .filter(|p| !p.is_empty()))
    }

    /// Every partition key held anywhere in the engine.
    pub fn partition_keys(&self) -> BTreeSet<Vec<u8>> {
        let state = self.state.read();
        let mut keys: BTreeSet<Vec<u8>> = state.active.keys().into_iter().collect();
        for memtable in &state.immutables {
            keys.extend(memtable.keys());
        }
        for table in &state.sstables {
            keys.extend(table.keys().map(|k| k.to_vec()));
        }
        keys
    }

    /// Compact the fullest size tier, if one has reached the threshold.
    pub fn compact(&self) -> Result<Option<CompactionReport>> {
        let _guard = self.compaction_lock.lock();
        let sstables = self.state.read().sstables.clone();
        let sizes: Vec<(u64, u64)> = sstables
            .iter()
            .map(|t| (t.id(), t.meta().file_size))
            .collect();

        let Some(bucket) = size_tiered_buckets(&sizes, self.config.compaction_threshold)
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let inputs: Vec<Arc<SsTable>> = sstables
            .into_iter()
            .filter(|t| bucket.contains(&t.id()))
            .collect();
        self.compact_tables(inputs, self.gc_before()).map(Some)
    }

    /// Merge every live sstable into one.
    pub fn major_compact(&self) -> Result<Option<CompactionReport>> {
        self.major_compact_with(self.gc_before())
    }

    pub(crate) fn major_compact_with(&self, gc_before: LocalTime) -> Result<Option<CompactionReport>> {
        let _guard = self.compaction_lock.lock();
        let inputs = self.state.read().sstables.clone();
        if inputs.is_empty() {
            return Ok(None);
        }
        self.compact_tables(inputs, gc_before).map(Some)
    }

    /// Tombstones applied locally at or before this time are expired.
    fn gc_before(&self) -> LocalTime {
        let grace = i64::try_from(self.config.tombstone_grace.as_millis()).unwrap_or(i64::MAX);
        (timestamp_now_millis() as LocalTime).saturating_sub(grace)
    }

    fn compact_tables(
        &self,
        inputs: Vec<Arc<SsTable>>,
        gc_before: LocalTime,
    ) -> Result<CompactionReport> {
        let input_ids: Vec<u64> = inputs.iter().map(|t| t.id()).collect();
        let input_set: HashSet<u64> = input_ids.iter().copied().collect();
        let bytes_before = inputs.iter().map(|t| t.meta().file_size).sum();
        let expected = inputs
            .iter()
            .map(|t| t.meta().partition_count as usize)
            .sum();

        // anything outside the compaction that may still hold shadowed data
        let (others, memtables) = {
            let state = self.state.read();
            let others: Vec<Arc<SsTable>> = state
                .sstables
                .iter()
                .filter(|t| !input_set.contains(&t.id()))
                .cloned()
                .collect();
            let mut memtables = vec![state.active.clone()];
            memtables.extend(state.immutables.iter().cloned());
            (others, memtables)
        };

        tracing::debug!("Compacting sstables {:?}", input_ids);
        let id = self.manifest.lock().allocate_id();
        let mut purged = 0u64;

        let output = MergingScanner::new(&inputs).and_then(|merged| {
            let stream = merged.filter_map(|item| match item {
                Ok(mut partition) => {
                    if partition.has_expired_tombstones(gc_before)
                        && !others.iter().any(|t| t.may_contain(&partition.key))
                        && !memtables.iter().any(|m| m.contains(&partition.key))
                    {
                        partition.purge_tombstones(gc_before);
                        purged += 1;
                    }
                    (!partition.is_empty()).then_some(Ok(partition))
                }
                Err(e) => Some(Err(e)),
            });
            write_sstable(
                &self.sstable_dir,
                id,
                stream,
                expected,
                FilterKind::Bloom,
                self.config.bloom_fp_rate,
            )
        });
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                if e.is_corruption() {
                    self.quarantine_corrupt(&inputs);
                }
                return Err(e);
            }
        };

        let output_id = output.as_ref().map(|t| t.id());
        let partitions_written = output.as_ref().map_or(0, |t| t.meta().partition_count);
        let bytes_after = output.as_ref().map_or(0, |t| t.meta().file_size);

        {
            let mut manifest = self.manifest.lock();
            let mut next = manifest.clone();
            next.replace(&input_ids, output_id);
            if let Err(e) = next.persist(&self.sstable_dir) {
                if let Some(t) = &output {
                    t.mark_obsolete();
                }
                return Err(e);
            }
            *manifest = next;
        }

        {
            let mut state = self.state.write();
            state.sstables.retain(|t| !input_set.contains(&t.id()));
            if let Some(t) = output {
                state.sstables.push(Arc::new(t));
                state.sstables.sort_by_key(|t| t.id());
            }
            self.metrics.live_sstables.set(state.sstables.len() as u64);
        }
        for table in &inputs {
            table.mark_obsolete();
        }

        self.metrics.compactions.inc();
        self.metrics.tombstones_purged.add(purged);

        Ok(CompactionReport {
            inputs: input_ids,
            output: output_id,
            partitions_written,
            partitions_purged: purged,
            bytes_before,
            bytes_after,
        })
    }

    /// Checksum every live sstable, quarantining the corrupt ones.
    pub fn verify(&self) -> EngineVerifyReport {
        let sstables = self.state.read().sstables.clone();
        let mut report = EngineVerifyReport::default();
        for table in &sstables {
            report.tables_checked += 1;
            match table.verify() {
                Ok(count) => report.partitions_checked += count,
                Err(e) => {
                    self.quarantine(table, &e);
                    report.quarantined.push(table.id());
                }
            }
        }
        report
    }

    fn quarantine_corrupt(&self, tables: &[Arc<SsTable>]) {
        for table in tables {
            if let Err(e) = table.verify() {
                if e.is_corruption() {
                    self.quarantine(table, &e);
                }
            }
        }
    }

    /// Take a corrupt table out of the live set and move its file aside.
    fn quarantine(&self, table: &Arc<SsTable>, cause: &Error) {
        let removed = {
            let mut state = self.state.write();
            let before = state.sstables.len();
            state.sstables.retain(|t| t.id() != table.id());
            self.metrics.live_sstables.set(state.sstables.len() as u64);
            before != state.sstables.len()
        };
        if !removed {
            return;
        }
        table.retire();
        self.metrics.sstables_quarantined.inc();
        tracing::error!(
            "SSTable {} is corrupt ({}); quarantined, reads fall back to other sources",
            table.id(),
            cause
        );

        {
            let mut manifest = self.manifest.lock();
            if manifest.remove(table.id()) {
                if let Err(e) = manifest.persist(&self.sstable_dir) {
                    tracing::error!("Failed to persist manifest after quarantine: {}", e);
                }
            }
        }
        move_to_quarantine(table.path(), &self.quarantine_dir);
    }

    pub fn sync(&self) -> Result<()> {
        self.commitlog.lock().sync()
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.state.read();
        EngineStats {
            memtable_bytes: state.active.size_bytes(),
            memtable_partitions: state.active.len(),
            frozen_memtables: state.immutables.len(),
            commitlog_segment: self.commitlog.lock().current_segment(),
            sstables: state.sstables.iter().map(|t| t.meta().clone()).collect(),
        }
    }

    pub fn sstable_dir(&self) -> &Path {
        &self.sstable_dir
    }

    pub fn manifest(&self) -> Manifest {
        self.manifest.lock().clone()
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }
}

fn move_to_quarantine(path: &Path, quarantine_dir: &Path) {
    let Some(name) = path.file_name() else {
        return;
    };
    if let Err(e) = std::fs::rename(path, quarantine_dir.join(name)) {
        tracing::error!("Failed to move {} to quarantine: {}", path.display(), e);
    }
}
