//! Live sstable set
//!
//! The manifest is the single source of truth for which sstables belong
//! to the engine and which commit log segments still need replaying. It
//! is replaced atomically (write tmp, fsync, rename), so a crash leaves
//! either the old or the new version. Any table file it does not name is
//! leftover output of an interrupted flush or compaction.

use crate::common::Result;
use crate::storage::sstable::{is_tmp_name, parse_table_name};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "MANIFEST";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub sstables: BTreeSet<u64>,
    pub next_sstable_id: u64,
    /// Commit log segments below this id are covered by sstables
    pub commitlog_low_water: u64,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: 0,
            sstables: BTreeSet::new(),
            next_sstable_id: 1,
            commitlog_low_water: 0,
        }
    }
}

impl Manifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Load the manifest in `dir`, or an empty one for a fresh directory.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let manifest: Manifest = serde_json::from_slice(&bytes)?;
                tracing::debug!(
                    "Loaded manifest v{} with {} sstable(s)",
                    manifest.version,
                    manifest.sstables.len()
                );
                Ok(manifest)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let manifest = Manifest::default();
                manifest.persist(dir)?;
                Ok(manifest)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the on-disk manifest with this one.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        let json = serde_json::to_vec_pretty(self)?;
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
        Ok(())
    }

    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_sstable_id;
        self.next_sstable_id += 1;
        id
    }

    /// Record a flushed table and advance the replay low-water mark.
    pub fn add_flushed(&mut self, id: u64, low_water: u64) {
        self.sstables.insert(id);
        self.commitlog_low_water = self.commitlog_low_water.max(low_water);
        self.next_sstable_id = self.next_sstable_id.max(id + 1);
        self.version += 1;
    }

    /// Swap compaction inputs for their output in one edit.
    pub fn replace(&mut self, inputs: &[u64], output: Option<u64>) {
        for id in inputs {
            self.sstables.remove(id);
        }
        if let Some(id) = output {
            self.sstables.insert(id);
            self.next_sstable_id = self.next_sstable_id.max(id + 1);
        }
        self.version += 1;
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let removed = self.sstables.remove(&id);
        if removed {
            self.version += 1;
        }
        removed
    }

    /// Delete table and tmp files in `dir` that this manifest does not name.
    pub fn remove_orphans(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let orphan = if is_tmp_name(name) {
                true
            } else {
                parse_table_name(name).is_some_and(|id| !self.sstables.contains(&id))
            };
            if orphan {
                std::fs::remove_file(entry.path())?;
                removed.push(entry.path());
            }
        }
        for path in &removed {
            tracing::info!("Removed orphaned file {}", path.display());
        }
        Ok(removed)
    }
}
