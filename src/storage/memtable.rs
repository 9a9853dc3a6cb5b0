//! In-memory write buffer
//!
//! Partitions sorted by key, each already merged with every mutation it
//! received. Readers and writers share a `RwLock`; a write holds it only
//! for the merge of one partition.

use crate::common::{Mutation, Partition};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct Memtable {
    partitions: RwLock<BTreeMap<Vec<u8>, Partition>>,
    size: AtomicUsize,
    /// First commit log segment that may hold writes applied here
    first_segment: u64,
}

impl Memtable {
    pub fn new(first_segment: u64) -> Self {
        Self {
            partitions: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            first_segment,
        }
    }

    /// Merge a mutation into the partition it targets.
    pub fn apply(&self, mutation: Mutation) {
        let mut partitions = self.partitions.write();
        match partitions.get_mut(&mutation.key) {
            Some(existing) => {
                let before = existing.size_estimate();
                existing.merge(mutation);
                let after = existing.size_estimate();
                if after >= before {
                    self.size.fetch_add(after - before, Ordering::Relaxed);
                } else {
                    self.size.fetch_sub(before - after, Ordering::Relaxed);
                }
            }
            None => {
                let mut partition = Partition::new(mutation.key.clone());
                partition.merge(mutation);
                self.size
                    .fetch_add(partition.size_estimate(), Ordering::Relaxed);
                partitions.insert(partition.key.clone(), partition);
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Partition> {
        self.partitions.read().get(key).cloned()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.partitions.read().contains_key(key)
    }

    /// Estimated bytes held.
    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }

    pub fn first_segment(&self) -> u64 {
        self.first_segment
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.partitions.read().keys().cloned().collect()
    }

    /// Sorted copy of every partition, for a flush.
    pub fn snapshot(&self) -> Vec<Partition> {
        self.partitions.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_apply_merges_versions() {
        let memtable = Memtable::new(0);
        memtable.apply(Partition::upsert("u1", "", [("name", "Alice")], 100));
        memtable.apply(Partition::upsert("u1", "", [("name", "Bob")], 50));
        memtable.apply(Partition::upsert("u2", "", [("name", "Carol")], 10));

        let p = memtable.get(b"u1").unwrap();
        assert_eq!(p.live_rows()[0].get("name"), Some(&b"Alice"[..]));
        assert_eq!(memtable.len(), 2);
        assert!(memtable.size_bytes() > 0);
        assert!(memtable.get(b"u3").is_none());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let memtable = Memtable::new(3);
        for key in ["c", "a", "b"] {
            memtable.apply(Partition::upsert(key, "", [("x", "1")], 1));
        }
        let keys: Vec<_> = memtable.snapshot().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(memtable.first_segment(), 3);
    }

    #[test]
    fn test_shadowed_data_shrinks_estimate() {
        let memtable = Memtable::new(0);
        memtable.apply(Partition::upsert("k", "r", [("a", vec![0u8; 1000])], 1));
        let before = memtable.size_bytes();
        memtable.apply(Partition::partition_deletion("k", 5));
        assert!(memtable.size_bytes() < before);
    }

    #[test]
    fn test_concurrent_writers() {
        let memtable = Arc::new(Memtable::new(0));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let memtable = memtable.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        memtable.apply(Partition::upsert(
                            format!("key-{}", i),
                            "",
                            [(format!("col-{}", t), "v")],
                            i as i64,
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(memtable.len(), 250);
        let p = memtable.get(b"key-7").unwrap();
        assert_eq!(p.rows.get(&b""[..]).unwrap().cells.len(), 4);
    }
}
