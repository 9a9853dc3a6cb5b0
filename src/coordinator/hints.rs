//! Hinted handoff storage
//!
//! A hint is a mutation a replica missed while unreachable. Hints are kept
//! per target in `hints/<hex node id>.hints`, framed like commit log
//! records, and mirrored in memory. Delivered or expired hints are removed
//! by rewriting the target's file.

use crate::common::{Mutation, NodeId, Result};
use crate::storage::commitlog::{encode_record, read_record};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

const HINT_SUFFIX: &str = ".hints";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    pub id: u64,
    pub target: NodeId,
    pub created_at_millis: u64,
    pub mutation: Mutation,
}

#[derive(Default)]
struct HintQueues {
    by_target: BTreeMap<NodeId, Vec<Hint>>,
    next_id: u64,
}

pub struct HintStore {
    dir: PathBuf,
    queues: Mutex<HintQueues>,
}

impl HintStore {
    /// Open the hint directory and load every stored hint.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut queues = HintQueues::default();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(target) = target_of(&path) else {
                continue;
            };
            let hints = load_file(&path)?;
            if let Some(max) = hints.iter().map(|h| h.id).max() {
                queues.next_id = queues.next_id.max(max + 1);
            }
            if !hints.is_empty() {
                tracing::info!("Loaded {} hint(s) for {}", hints.len(), target);
                queues.by_target.insert(target, hints);
            }
        }

        Ok(Self {
            dir,
            queues: Mutex::new(queues),
        })
    }

    /// Durably record a mutation for `target`.
    pub fn store(&self, target: &NodeId, mutation: Mutation, now_millis: u64) -> Result<()> {
        let mut queues = self.queues.lock();
        let hint = Hint {
            id: queues.next_id,
            target: target.clone(),
            created_at_millis: now_millis,
            mutation,
        };

        let payload = bincode::serialize(&hint)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(target))?;
        file.write_all(&encode_record(hint.id, &payload))?;
        file.sync_data()?;

        queues.next_id += 1;
        queues.by_target.entry(target.clone()).or_default().push(hint);
        Ok(())
    }

    /// Targets with at least one pending hint.
    pub fn targets(&self) -> Vec<NodeId> {
        self.queues.lock().by_target.keys().cloned().collect()
    }

    pub fn pending(&self, target: &NodeId) -> Vec<Hint> {
        self.queues
            .lock()
            .by_target
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.queues.lock().by_target.values().map(Vec::len).sum()
    }

    /// Forget delivered hints.
    pub fn remove(&self, target: &NodeId, ids: &HashSet<u64>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut queues = self.queues.lock();
        let Some(hints) = queues.by_target.get_mut(target) else {
            return Ok(());
        };
        hints.retain(|h| !ids.contains(&h.id));
        let remaining = hints.clone();
        if remaining.is_empty() {
            queues.by_target.remove(target);
        }
        self.rewrite(target, &remaining)
    }

    /// Drop hints created before `cutoff_millis`. Returns the dropped hints.
    pub fn expire(&self, cutoff_millis: u64) -> Result<Vec<Hint>> {
        let mut queues = self.queues.lock();
        let mut dropped = Vec::new();
        let mut touched = Vec::new();
        for (target, hints) in queues.by_target.iter_mut() {
            let before = hints.len();
            let (old, keep): (Vec<Hint>, Vec<Hint>) = std::mem::take(hints)
                .into_iter()
                .partition(|h| h.created_at_millis < cutoff_millis);
            *hints = keep;
            if hints.len() != before {
                dropped.extend(old);
                touched.push((target.clone(), hints.clone()));
            }
        }
        queues.by_target.retain(|_, hints| !hints.is_empty());
        for (target, remaining) in touched {
            self.rewrite(&target, &remaining)?;
        }
        Ok(dropped)
    }

    fn rewrite(&self, target: &NodeId, hints: &[Hint]) -> Result<()> {
        let path = self.path_for(target);
        if hints.is_empty() {
            match std::fs::remove_file(&path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        let tmp = path.with_extension("hints.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            for hint in hints {
                let payload = bincode::serialize(hint)?;
                file.write_all(&encode_record(hint.id, &payload))?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn path_for(&self, target: &NodeId) -> PathBuf {
        self.dir
            .join(format!("{}{}", hex::encode(target.as_str()), HINT_SUFFIX))
    }
}

fn target_of(path: &Path) -> Option<NodeId> {
    let name = path.file_name()?.to_str()?;
    let encoded = name.strip_suffix(HINT_SUFFIX)?;
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok().map(NodeId)
}

/// Read a hint file up to the first damaged record.
fn load_file(path: &Path) -> Result<Vec<Hint>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hints = Vec::new();
    loop {
        match read_record(&mut reader) {
            Ok(Some((_, payload))) => match bincode::deserialize::<Hint>(&payload) {
                Ok(hint) => hints.push(hint),
                Err(e) => {
                    tracing::warn!("Undecodable hint in {}: {}", path.display(), e);
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Hint file {} ends in a damaged record: {}", path.display(), e);
                break;
            }
        }
    }
    Ok(hints)
}
