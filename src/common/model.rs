//! Wide-column data model
//!
//! A partition is the unit of placement and replication. The same
//! `Partition` type is a write fragment (mutation), a memtable entry,
//! an sstable record and a replica's read response, so there is exactly
//! one merge function and it is total, commutative and idempotent.
//!
//! Reconciliation rules:
//! - a cell's visible value is the one with the highest timestamp
//! - on a timestamp tie a tombstone wins, then the greater value bytes win
//! - a row deletion at T shadows every cell of the row with timestamp <= T
//! - a partition deletion at T shadows every row deletion and cell <= T
//!
//! Every tombstone also carries the node-local wall clock time at which it
//! was applied. Garbage collection is driven by that time only, so writers
//! are free to use logical timestamps.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Writer-supplied timestamp, microseconds since the Unix epoch.
pub type Timestamp = i64;

/// Node wall clock, milliseconds since the Unix epoch, at which a tombstone
/// was applied locally. Zero until the storage engine stamps it.
pub type LocalTime = i64;

/// A write is just a partition fragment.
pub type Mutation = Partition;

/// Cluster-wide node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Position on the hash ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token(pub u128);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Row or partition deletion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Deletion {
    pub timestamp: Timestamp,
    pub local_time: LocalTime,
}

impl Deletion {
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            local_time: 0,
        }
    }
}

/// A single column version. `value == None` is a column tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub timestamp: Timestamp,
    pub value: Option<Vec<u8>>,
    /// Only meaningful for tombstones.
    pub local_deletion_time: LocalTime,
}

impl Cell {
    pub fn live(value: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            value: Some(value.into()),
            local_deletion_time: 0,
        }
    }

    pub fn tombstone(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            value: None,
            local_deletion_time: 0,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Total order used for conflict resolution; the greater cell wins.
    pub fn reconcile_cmp(&self, other: &Cell) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.is_tombstone().cmp(&other.is_tombstone()))
            .then_with(|| self.value.cmp(&other.value))
            .then_with(|| self.local_deletion_time.cmp(&other.local_deletion_time))
    }

    /// Same client-visible version, ignoring when it was applied locally.
    pub fn same_version(&self, other: &Cell) -> bool {
        self.timestamp == other.timestamp && self.value == other.value
    }

    fn size(&self) -> usize {
        16 + self.value.as_ref().map_or(0, |v| v.len())
    }
}

/// One row of a partition: an optional row tombstone plus sparse cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowData {
    pub deletion: Option<Deletion>,
    pub cells: BTreeMap<String, Cell>,
}

impl RowData {
    pub fn merge(&mut self, other: RowData) {
        self.deletion = max_deletion(self.deletion, other.deletion);
        for (name, cell) in other.cells {
            match self.cells.get_mut(&name) {
                Some(existing) => {
                    if cell.reconcile_cmp(existing) == Ordering::Greater {
                        *existing = cell;
                    }
                }
                None => {
                    self.cells.insert(name, cell);
                }
            }
        }
    }

    /// Drop cells shadowed by the row or partition deletion. Returns
    /// false when nothing is left in the row.
    fn normalize(&mut self, partition_deletion: Option<Deletion>) -> bool {
        if let (Some(row), Some(part)) = (self.deletion, partition_deletion) {
            if row.timestamp <= part.timestamp {
                self.deletion = None;
            }
        }
        if let Some(shadow) = max_deletion(self.deletion, partition_deletion) {
            self.cells.retain(|_, cell| cell.timestamp > shadow.timestamp);
        }
        self.deletion.is_some() || !self.cells.is_empty()
    }

    pub fn has_live_cells(&self) -> bool {
        self.cells.values().any(|c| !c.is_tombstone())
    }

    fn size(&self) -> usize {
        16 + self
            .cells
            .iter()
            .map(|(name, cell)| name.len() + cell.size())
            .sum::<usize>()
    }
}

/// All rows sharing a partition key, sorted by clustering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub key: Vec<u8>,
    pub deletion: Option<Deletion>,
    pub rows: BTreeMap<Vec<u8>, RowData>,
}

impl Partition {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            deletion: None,
            rows: BTreeMap::new(),
        }
    }

    /// Fragment writing `columns` into one row at `timestamp`.
    pub fn upsert<I, N, V>(
        key: impl Into<Vec<u8>>,
        clustering: impl Into<Vec<u8>>,
        columns: I,
        timestamp: Timestamp,
    ) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<Vec<u8>>,
    {
        let mut row = RowData::default();
        for (name, value) in columns {
            row.cells.insert(name.into(), Cell::live(value, timestamp));
        }
        let mut partition = Self::new(key);
        partition.rows.insert(clustering.into(), row);
        partition
    }

    /// Fragment deleting individual columns of one row.
    pub fn column_deletion<I, N>(
        key: impl Into<Vec<u8>>,
        clustering: impl Into<Vec<u8>>,
        columns: I,
        timestamp: Timestamp,
    ) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let mut row = RowData::default();
        for name in columns {
            row.cells.insert(name.into(), Cell::tombstone(timestamp));
        }
        let mut partition = Self::new(key);
        partition.rows.insert(clustering.into(), row);
        partition
    }

    /// Fragment deleting one whole row.
    pub fn row_deletion(
        key: impl Into<Vec<u8>>,
        clustering: impl Into<Vec<u8>>,
        timestamp: Timestamp,
    ) -> Self {
        let mut partition = Self::new(key);
        partition.rows.insert(
            clustering.into(),
            RowData {
                deletion: Some(Deletion::at(timestamp)),
                cells: BTreeMap::new(),
            },
        );
        partition
    }

    /// Fragment deleting the whole partition.
    pub fn partition_deletion(key: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        let mut partition = Self::new(key);
        partition.deletion = Some(Deletion::at(timestamp));
        partition
    }

    /// Merge another version of the same partition into this one.
    pub fn merge(&mut self, other: Partition) {
        debug_assert_eq!(self.key, other.key, "merging different partitions");
        self.deletion = max_deletion(self.deletion, other.deletion);
        for (clustering, row) in other.rows {
            self.rows.entry(clustering).or_default().merge(row);
        }
        self.normalize();
    }

    /// Merge a sequence of versions; `None` if the sequence is empty.
    pub fn merge_all<I: IntoIterator<Item = Partition>>(versions: I) -> Option<Partition> {
        let mut iter = versions.into_iter();
        let mut merged = iter.next()?;
        merged.normalize();
        for version in iter {
            merged.merge(version);
        }
        Some(merged)
    }

    fn normalize(&mut self) {
        let deletion = self.deletion;
        self.rows.retain(|_, row| row.normalize(deletion));
    }

    pub fn is_empty(&self) -> bool {
        self.deletion.is_none() && self.rows.is_empty()
    }

    /// Rough in-memory footprint, used for memtable accounting.
    pub fn size_estimate(&self) -> usize {
        self.key.len()
            + 16
            + self
                .rows
                .iter()
                .map(|(ck, row)| ck.len() + row.size())
                .sum::<usize>()
    }

    /// Lowest and highest timestamp carried by any cell or tombstone.
    pub fn timestamp_range(&self) -> Option<(Timestamp, Timestamp)> {
        let mut range: Option<(Timestamp, Timestamp)> = None;
        let mut see = |ts: Timestamp| {
            range = Some(match range {
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
                None => (ts, ts),
            });
        };
        if let Some(d) = self.deletion {
            see(d.timestamp);
        }
        for row in self.rows.values() {
            if let Some(d) = row.deletion {
                see(d.timestamp);
            }
            for cell in row.cells.values() {
                see(cell.timestamp);
            }
        }
        range
    }

    /// Restrict to one row and/or a set of columns. Deletions that cover
    /// the selection are kept so replicas can still be reconciled.
    pub fn slice(&self, clustering: Option<&[u8]>, columns: Option<&[String]>) -> Partition {
        let mut out = Partition::new(self.key.clone());
        out.deletion = self.deletion;
        for (ck, row) in &self.rows {
            if clustering.is_some_and(|wanted| wanted != ck.as_slice()) {
                continue;
            }
            let cells = match columns {
                Some(cols) => row
                    .cells
                    .iter()
                    .filter(|(name, _)| cols.iter().any(|c| c == *name))
                    .map(|(n, c)| (n.clone(), c.clone()))
                    .collect(),
                None => row.cells.clone(),
            };
            let row = RowData {
                deletion: row.deletion,
                cells,
            };
            if row.deletion.is_some() || !row.cells.is_empty() {
                out.rows.insert(ck.clone(), row);
            }
        }
        out
    }

    /// The part of `self` (a resolved version) that `other` is missing or
    /// holds an older version of. `None` when `other` is up to date.
    pub fn diff(&self, other: Option<&Partition>) -> Option<Partition> {
        let Some(other) = other else {
            return if self.is_empty() {
                None
            } else {
                Some(self.clone())
            };
        };

        let mut out = Partition::new(self.key.clone());
        if deletion_timestamp(self.deletion) > deletion_timestamp(other.deletion) {
            out.deletion = self.deletion;
        }
        for (ck, row) in &self.rows {
            let theirs = other.rows.get(ck);
            let mut patch = RowData::default();
            let their_deletion = theirs.and_then(|r| r.deletion);
            if deletion_timestamp(row.deletion) > deletion_timestamp(their_deletion) {
                patch.deletion = row.deletion;
            }
            for (name, cell) in &row.cells {
                let stale = match theirs.and_then(|r| r.cells.get(name)) {
                    Some(their_cell) => !their_cell.same_version(cell),
                    None => true,
                };
                if stale {
                    patch.cells.insert(name.clone(), cell.clone());
                }
            }
            if patch.deletion.is_some() || !patch.cells.is_empty() {
                out.rows.insert(ck.clone(), patch);
            }
        }

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Record `now` as the local deletion time of every tombstone carried.
    /// Done once per node, when the fragment is applied there.
    pub fn stamp_deletions(&mut self, now: LocalTime) {
        if let Some(d) = self.deletion.as_mut() {
            d.local_time = now;
        }
        for row in self.rows.values_mut() {
            if let Some(d) = row.deletion.as_mut() {
                d.local_time = now;
            }
            for cell in row.cells.values_mut().filter(|c| c.is_tombstone()) {
                cell.local_deletion_time = now;
            }
        }
    }

    /// Whether any tombstone was applied locally at or before `gc_before`.
    pub fn has_expired_tombstones(&self, gc_before: LocalTime) -> bool {
        let expired = |d: Option<Deletion>| d.is_some_and(|d| d.local_time <= gc_before);
        expired(self.deletion)
            || self.rows.values().any(|row| {
                expired(row.deletion)
                    || row
                        .cells
                        .values()
                        .any(|c| c.is_tombstone() && c.local_deletion_time <= gc_before)
            })
    }

    /// Drop tombstones applied locally at or before `gc_before`. Only safe
    /// once every replica has had the chance to see them and no older data
    /// may be shadowed.
    pub fn purge_tombstones(&mut self, gc_before: LocalTime) {
        if self.deletion.is_some_and(|d| d.local_time <= gc_before) {
            self.deletion = None;
        }
        self.rows.retain(|_, row| {
            if row.deletion.is_some_and(|d| d.local_time <= gc_before) {
                row.deletion = None;
            }
            row.cells.retain(|_, cell| {
                !(cell.is_tombstone() && cell.local_deletion_time <= gc_before)
            });
            row.deletion.is_some() || !row.cells.is_empty()
        });
    }

    /// Rows with at least one visible column.
    pub fn live_rows(&self) -> Vec<Row> {
        self.rows
            .iter()
            .filter(|(_, row)| row.has_live_cells())
            .map(|(ck, row)| Row {
                partition_key: self.key.clone(),
                clustering_key: ck.clone(),
                columns: row
                    .cells
                    .iter()
                    .filter_map(|(name, cell)| {
                        cell.value.as_ref().map(|v| (name.clone(), v.clone()))
                    })
                    .collect(),
            })
            .collect()
    }
}

/// A visible row as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub partition_key: Vec<u8>,
    pub clustering_key: Vec<u8>,
    pub columns: BTreeMap<String, Vec<u8>>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&[u8]> {
        self.columns.get(column).map(|v| v.as_slice())
    }
}

/// What a replica is asked to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCommand {
    pub partition_key: Vec<u8>,
    pub clustering: Option<Vec<u8>>,
    pub columns: Option<Vec<String>>,
}

impl ReadCommand {
    pub fn partition(key: impl Into<Vec<u8>>) -> Self {
        Self {
            partition_key: key.into(),
            clustering: None,
            columns: None,
        }
    }

    pub fn row(key: impl Into<Vec<u8>>, clustering: impl Into<Vec<u8>>) -> Self {
        Self {
            partition_key: key.into(),
            clustering: Some(clustering.into()),
            columns: None,
        }
    }
}

fn deletion_timestamp(d: Option<Deletion>) -> Option<Timestamp> {
    d.map(|d| d.timestamp)
}

fn max_deletion(a: Option<Deletion>, b: Option<Deletion>) -> Option<Deletion> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_of(p: &Partition, ck: &[u8], col: &str) -> Option<Cell> {
        p.rows.get(ck).and_then(|r| r.cells.get(col)).cloned()
    }

    #[test]
    fn test_highest_timestamp_wins() {
        let mut a = Partition::upsert("u1", "", [("name", "Alice")], 100);
        a.merge(Partition::upsert("u1", "", [("name", "Bob")], 200));
        assert_eq!(cell_of(&a, b"", "name"), Some(Cell::live("Bob", 200)));

        let mut b = Partition::upsert("u1", "", [("name", "Bob")], 200);
        b.merge(Partition::upsert("u1", "", [("name", "Alice")], 100));
        assert_eq!(a, b);
    }

    #[test]
    fn test_tie_breaks_on_value_bytes() {
        let mut a = Partition::upsert("k", "", [("c", "aaa")], 5);
        a.merge(Partition::upsert("k", "", [("c", "zzz")], 5));
        let mut b = Partition::upsert("k", "", [("c", "zzz")], 5);
        b.merge(Partition::upsert("k", "", [("c", "aaa")], 5));
        assert_eq!(cell_of(&a, b"", "c"), Some(Cell::live("zzz", 5)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_tombstone_wins_tie() {
        let mut p = Partition::upsert("k", "", [("x", "1")], 10);
        p.merge(Partition::column_deletion("k", "", ["x"], 10));
        assert!(cell_of(&p, b"", "x").unwrap().is_tombstone());
        assert!(p.live_rows().is_empty());
    }

    #[test]
    fn test_tombstone_shadowing_and_resurrection() {
        let mut p = Partition::upsert("k", "", [("x", "1")], 5);
        p.merge(Partition::column_deletion("k", "", ["x"], 10));
        assert!(p.live_rows().is_empty());

        p.merge(Partition::upsert("k", "", [("x", "2")], 15));
        let rows = p.live_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("x"), Some(&b"2"[..]));
    }

    #[test]
    fn test_row_deletion_shadows_older_cells() {
        let mut p = Partition::upsert("k", "r1", [("a", "1"), ("b", "2")], 5);
        p.merge(Partition::upsert("k", "r1", [("c", "3")], 20));
        p.merge(Partition::row_deletion("k", "r1", 10));

        let row = p.rows.get(&b"r1"[..]).unwrap();
        assert_eq!(row.deletion, Some(Deletion::at(10)));
        assert_eq!(row.cells.len(), 1);
        assert!(row.cells.contains_key("c"));
    }

    #[test]
    fn test_partition_deletion_shadows_rows() {
        let mut p = Partition::upsert("k", "r1", [("a", "1")], 5);
        p.merge(Partition::upsert("k", "r2", [("a", "1")], 50));
        p.merge(Partition::row_deletion("k", "r2", 8));
        p.merge(Partition::partition_deletion("k", 10));

        assert_eq!(p.deletion, Some(Deletion::at(10)));
        assert!(!p.rows.contains_key(&b"r1"[..]));
        // row deletion at 8 is redundant under the partition deletion at 10
        assert_eq!(p.rows.get(&b"r2"[..]).unwrap().deletion, None);
        assert_eq!(p.live_rows().len(), 1);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut p = Partition::upsert("k", "r", [("a", "1")], 5);
        p.merge(Partition::row_deletion("k", "r", 3));
        let snapshot = p.clone();
        p.merge(snapshot.clone());
        assert_eq!(p, snapshot);
    }

    #[test]
    fn test_diff_sends_only_missing_parts() {
        let mut resolved = Partition::upsert("k", "", [("a", "new"), ("b", "same")], 20);
        resolved.merge(Partition::upsert("k", "", [("b", "same")], 20));

        let mut stale = Partition::upsert("k", "", [("a", "old")], 10);
        stale.merge(Partition::upsert("k", "", [("b", "same")], 20));

        let patch = resolved.diff(Some(&stale)).unwrap();
        let row = patch.rows.get(&b""[..]).unwrap();
        assert_eq!(row.cells.len(), 1);
        assert_eq!(row.cells.get("a"), Some(&Cell::live("new", 20)));

        assert!(resolved.diff(Some(&resolved)).is_none());
        assert_eq!(resolved.diff(None), Some(resolved.clone()));
    }

    #[test]
    fn test_purge_tombstones_by_local_time() {
        let mut old = Partition::column_deletion("k", "r", ["b"], 50);
        old.merge(Partition::row_deletion("k", "gone", 40));
        old.stamp_deletions(1_000);
        let mut recent = Partition::column_deletion("k", "r", ["c"], 45);
        recent.stamp_deletions(5_000);

        let mut p = Partition::upsert("k", "r", [("a", "1")], 100);
        p.merge(old);
        p.merge(recent);
        assert!(p.has_expired_tombstones(2_000));

        p.purge_tombstones(2_000);
        assert!(!p.rows.contains_key(&b"gone"[..]));
        let row = p.rows.get(&b"r"[..]).unwrap();
        assert!(!row.cells.contains_key("b"));
        assert!(row.cells.contains_key("a"));
        // writer timestamp is older but the tombstone arrived later
        assert!(row.cells.get("c").unwrap().is_tombstone());
        assert!(!p.has_expired_tombstones(2_000));
    }

    #[test]
    fn test_local_time_does_not_count_as_divergence() {
        let mut here = Partition::column_deletion("k", "", ["x"], 10);
        here.stamp_deletions(1_000);
        let mut there = Partition::column_deletion("k", "", ["x"], 10);
        there.stamp_deletions(9_000);
        assert!(here.diff(Some(&there)).is_none());

        let mut a = here.clone();
        a.merge(there.clone());
        let mut b = there;
        b.merge(here);
        assert_eq!(a, b);
    }

    #[test]
    fn test_slice_keeps_covering_deletions() {
        let mut p = Partition::upsert("k", "r1", [("a", "1"), ("b", "2")], 5);
        p.merge(Partition::upsert("k", "r2", [("a", "3")], 5));
        p.merge(Partition::partition_deletion("k", 1));

        let cols = vec!["a".to_string()];
        let s = p.slice(Some(b"r1"), Some(&cols));
        assert_eq!(s.deletion, Some(Deletion::at(1)));
        assert_eq!(s.rows.len(), 1);
        assert_eq!(s.rows.get(&b"r1"[..]).unwrap().cells.len(), 1);
    }

    #[test]
    fn test_timestamp_range() {
        let mut p = Partition::upsert("k", "", [("a", "1")], 7);
        p.merge(Partition::row_deletion("k", "x", 3));
        assert_eq!(p.timestamp_range(), Some((3, 7)));
        assert_eq!(Partition::new("k").timestamp_range(), None);
    }
}
