//! Immutable sorted tables
//!
//! File layout (`sst-<id>.db`):
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Data: [LEN(4)][bincode(Partition)][CRC32(4)]  │  sorted by partition key
//! │ ...                                          │
//! ├──────────────────────────────────────────────┤
//! │ Index: [COUNT(4)] then per partition         │
//! │        [KEY_LEN(4)][KEY][OFFSET(8)][LEN(4)]   │
//! ├──────────────────────────────────────────────┤
//! │ Filter: [KIND(1)][encoded filter]            │
//! ├──────────────────────────────────────────────┤
//! │ Footer (fixed size, see `Footer`)            │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Tables are written to `*.tmp`, fsynced and renamed, so a table that
//! exists under its final name is complete. Reads open their own file
//! handle and never take a lock.

use crate::common::{crc32, Error, Partition, Result, Timestamp};
use crate::storage::filter::{decode_filter, new_filter, FilterKind, MembershipFilter};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Magic number at the end of every table ("RKVSST01").
pub const SSTABLE_MAGIC: u64 = 0x524B_5653_5354_3031;

const TABLE_PREFIX: &str = "sst-";
const TABLE_SUFFIX: &str = ".db";
const TMP_SUFFIX: &str = ".tmp";

pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{}{}", TABLE_PREFIX, id, TABLE_SUFFIX))
}

/// Parse `sst-<id>.db`; `None` for anything else.
pub fn parse_table_name(name: &str) -> Option<u64> {
    name.strip_prefix(TABLE_PREFIX)?
        .strip_suffix(TABLE_SUFFIX)?
        .parse()
        .ok()
}

pub fn is_tmp_name(name: &str) -> bool {
    name.ends_with(TMP_SUFFIX)
}

/// Summary of a table, read from its footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsTableMeta {
    pub id: u64,
    pub file_size: u64,
    pub partition_count: u64,
    pub min_timestamp: Option<Timestamp>,
    pub max_timestamp: Option<Timestamp>,
}

/// Fixed-size trailer locating the index and filter blocks.
///
/// ```text
/// index offset (8) | index len (8) | filter offset (8) | filter len (8)
/// partition count (8) | min ts (8) | max ts (8) | magic (8)
/// index crc (4) | filter crc (4) | footer crc (4)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
struct Footer {
    index_offset: u64,
    index_len: u64,
    filter_offset: u64,
    filter_len: u64,
    partition_count: u64,
    min_timestamp: i64,
    max_timestamp: i64,
    index_crc: u32,
    filter_crc: u32,
}

impl Footer {
    const SIZE: usize = 8 * 8 + 4 * 3;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.index_offset.to_le_bytes());
        buf.extend_from_slice(&self.index_len.to_le_bytes());
        buf.extend_from_slice(&self.filter_offset.to_le_bytes());
        buf.extend_from_slice(&self.filter_len.to_le_bytes());
        buf.extend_from_slice(&self.partition_count.to_le_bytes());
        buf.extend_from_slice(&self.min_timestamp.to_le_bytes());
        buf.extend_from_slice(&self.max_timestamp.to_le_bytes());
        buf.extend_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.index_crc.to_le_bytes());
        buf.extend_from_slice(&self.filter_crc.to_le_bytes());
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(data: &[u8], file: &str) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(Error::corruption(file, "footer truncated"));
        }
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[i..i + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&data[i..i + 4]);
            u32::from_le_bytes(b)
        };

        let magic = u64_at(56);
        if magic != SSTABLE_MAGIC {
            return Err(Error::corruption(
                file,
                format!("bad magic: expected {:#x}, got {:#x}", SSTABLE_MAGIC, magic),
            ));
        }
        let stored_crc = u32_at(Self::SIZE - 4);
        if crc32(&data[..Self::SIZE - 4]) != stored_crc {
            return Err(Error::corruption(file, "footer checksum mismatch"));
        }

        Ok(Footer {
            index_offset: u64_at(0),
            index_len: u64_at(8),
            filter_offset: u64_at(16),
            filter_len: u64_at(24),
            partition_count: u64_at(32),
            min_timestamp: u64_at(40) as i64,
            max_timestamp: u64_at(48) as i64,
            index_crc: u32_at(64),
            filter_crc: u32_at(68),
        })
    }
}

/// Index entry: where one partition's record lives.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexEntry {
    key: Vec<u8>,
    offset: u64,
    len: u32,
}

/// Write a table from partitions sorted by key.
///
/// `expected_partitions` sizes the membership filter; it may overestimate.
/// Returns `None` when the input held no partition (no file is left behind).
pub fn write_sstable<I>(
    dir: &Path,
    id: u64,
    partitions: I,
    expected_partitions: usize,
    filter_kind: FilterKind,
    false_positive_rate: f64,
) -> Result<Option<SsTable>>
where
    I: IntoIterator<Item = Result<Partition>>,
{
    let final_path = table_path(dir, id);
    let tmp_path = final_path.with_extension(format!("db{}", TMP_SUFFIX));

    let written = write_table_file(
        &tmp_path,
        partitions,
        expected_partitions,
        filter_kind,
        false_positive_rate,
    );
    match written {
        Ok(0) => {
            let _ = std::fs::remove_file(&tmp_path);
            Ok(None)
        }
        Ok(_) => {
            std::fs::rename(&tmp_path, &final_path)?;
            sync_dir(dir);
            Ok(Some(SsTable::open(&final_path, id)?))
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn write_table_file<I>(
    path: &Path,
    partitions: I,
    expected_partitions: usize,
    filter_kind: FilterKind,
    false_positive_rate: f64,
) -> Result<u64>
where
    I: IntoIterator<Item = Result<Partition>>,
{
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);

    let mut filter = new_filter(filter_kind, expected_partitions, false_positive_rate);
    let mut index: Vec<IndexEntry> = Vec::new();
    let mut offset = 0u64;
    let mut min_ts = i64::MAX;
    let mut max_ts = i64::MIN;

    for partition in partitions {
        let partition = partition?;
        if let Some(last) = index.last() {
            if last.key >= partition.key {
                return Err(Error::Internal(
                    "sstable input is not sorted by partition key".into(),
                ));
            }
        }
        if let Some((lo, hi)) = partition.timestamp_range() {
            min_ts = min_ts.min(lo);
            max_ts = max_ts.max(hi);
        }

        let payload = bincode::serialize(&partition)?;
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.write_all(&crc32(&payload).to_le_bytes())?;

        filter.insert(&partition.key);
        let record_len = 4 + payload.len() as u32 + 4;
        index.push(IndexEntry {
            key: partition.key,
            offset,
            len: record_len,
        });
        offset += record_len as u64;
    }

    if index.is_empty() {
        return Ok(0);
    }

    let mut index_block = Vec::new();
    index_block.extend_from_slice(&(index.len() as u32).to_le_bytes());
    for entry in &index {
        index_block.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
        index_block.extend_from_slice(&entry.key);
        index_block.extend_from_slice(&entry.offset.to_le_bytes());
        index_block.extend_from_slice(&entry.len.to_le_bytes());
    }

    let mut filter_block = vec![filter.kind() as u8];
    filter_block.extend_from_slice(&filter.encode());

    let index_offset = offset;
    let filter_offset = index_offset + index_block.len() as u64;
    writer.write_all(&index_block)?;
    writer.write_all(&filter_block)?;

    let footer = Footer {
        index_offset,
        index_len: index_block.len() as u64,
        filter_offset,
        filter_len: filter_block.len() as u64,
        partition_count: index.len() as u64,
        min_timestamp: min_ts,
        max_timestamp: max_ts,
        index_crc: crc32(&index_block),
        filter_crc: crc32(&filter_block),
    };
    writer.write_all(&footer.encode())?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    Ok(index.len() as u64)
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// An open, immutable table: index and filter in memory, data on disk.
pub struct SsTable {
    id: u64,
    path: PathBuf,
    index: Vec<IndexEntry>,
    filter: Box<dyn MembershipFilter>,
    meta: SsTableMeta,
    data_len: u64,
    /// No longer part of the live set (compacted away or quarantined)
    retired: AtomicBool,
    /// Remove the file when the last reference goes away
    delete_on_drop: AtomicBool,
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("meta", &self.meta)
            .finish()
    }
}

impl SsTable {
    /// Open a table, verifying the footer, index and filter checksums.
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let name = path.display().to_string();
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < Footer::SIZE as u64 {
            return Err(Error::corruption(&name, "file shorter than footer"));
        }

        let mut footer_bytes = vec![0u8; Footer::SIZE];
        file.seek(SeekFrom::Start(file_size - Footer::SIZE as u64))?;
        file.read_exact(&mut footer_bytes)?;
        let footer = Footer::decode(&footer_bytes, &name)?;

        let blocks_end = footer.filter_offset.checked_add(footer.filter_len);
        if footer.index_offset.checked_add(footer.index_len) != Some(footer.filter_offset)
            || blocks_end != Some(file_size - Footer::SIZE as u64)
        {
            return Err(Error::corruption(&name, "footer offsets out of range"));
        }

        let mut index_block = vec![0u8; footer.index_len as usize];
        file.seek(SeekFrom::Start(footer.index_offset))?;
        file.read_exact(&mut index_block)?;
        if crc32(&index_block) != footer.index_crc {
            return Err(Error::corruption(&name, "index checksum mismatch"));
        }

        let mut filter_block = vec![0u8; footer.filter_len as usize];
        file.read_exact(&mut filter_block)?;
        if crc32(&filter_block) != footer.filter_crc || filter_block.is_empty() {
            return Err(Error::corruption(&name, "filter checksum mismatch"));
        }

        let index = decode_index(&index_block, footer.index_offset, &name)?;
        if index.len() as u64 != footer.partition_count {
            return Err(Error::corruption(&name, "index count disagrees with footer"));
        }
        let kind = FilterKind::from_byte(filter_block[0])
            .map_err(|e| Error::corruption(&name, e.to_string()))?;
        let filter = decode_filter(kind, &filter_block[1..])
            .map_err(|e| Error::corruption(&name, e.to_string()))?;

        let meta = SsTableMeta {
            id,
            file_size,
            partition_count: footer.partition_count,
            min_timestamp: (footer.partition_count > 0 && footer.min_timestamp != i64::MAX)
                .then_some(footer.min_timestamp),
            max_timestamp: (footer.partition_count > 0 && footer.max_timestamp != i64::MIN)
                .then_some(footer.max_timestamp),
        };

        Ok(Self {
            id,
            path: path.to_path_buf(),
            index,
            filter,
            meta,
            data_len: footer.index_offset,
            retired: AtomicBool::new(false),
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &SsTableMeta {
        &self.meta
    }

    /// Membership filter check; `false` means the key is certainly absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.filter.may_contain(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.index.iter().map(|e| e.key.as_slice())
    }

    /// Point lookup through the index.
    pub fn get(&self, key: &[u8]) -> Result<Option<Partition>> {
        let Ok(pos) = self.index.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
            return Ok(None);
        };
        let entry = &self.index[pos];

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut record = vec![0u8; entry.len as usize];
        file.read_exact(&mut record)?;

        let partition = decode_record(&record, &self.path)?;
        if partition.key != key {
            return Err(Error::corruption(
                self.path.display().to_string(),
                "index points at the wrong partition",
            ));
        }
        Ok(Some(partition))
    }

    /// Sequential scan of every partition in key order.
    pub fn scan(&self) -> Result<SsTableScanner> {
        let file = File::open(&self.path)?;
        Ok(SsTableScanner {
            reader: BufReader::new(file),
            path: self.path.clone(),
            remaining: self.data_len,
        })
    }

    /// Read and checksum every record. Returns the number of partitions.
    pub fn verify(&self) -> Result<u64> {
        let mut count = 0u64;
        for (entry, partition) in self.index.iter().zip(self.scan()?) {
            let partition = partition?;
            if partition.key != entry.key {
                return Err(Error::corruption(
                    self.path.display().to_string(),
                    "data order disagrees with index",
                ));
            }
            count += 1;
        }
        if count != self.meta.partition_count {
            return Err(Error::corruption(
                self.path.display().to_string(),
                "fewer records than indexed",
            ));
        }
        Ok(count)
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Delete the file once no reader holds this table any more.
    pub fn mark_obsolete(&self) {
        self.retire();
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for SsTable {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to delete obsolete sstable {}: {}", self.path.display(), e);
            }
        }
    }
}

fn decode_index(block: &[u8], data_len: u64, file: &str) -> Result<Vec<IndexEntry>> {
    let mut pos = 0usize;
    let count = u32::from_le_bytes(fixed(block, &mut pos, file)?) as usize;

    let mut entries = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        let key_len = u32::from_le_bytes(fixed(block, &mut pos, file)?) as usize;
        let key = take(block, &mut pos, key_len, file)?.to_vec();
        let entry = IndexEntry {
            key,
            offset: u64::from_le_bytes(fixed(block, &mut pos, file)?),
            len: u32::from_le_bytes(fixed(block, &mut pos, file)?),
        };
        if entry.offset + entry.len as u64 > data_len {
            return Err(Error::corruption(file, "index entry points past data"));
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn take<'a>(block: &'a [u8], pos: &mut usize, n: usize, file: &str) -> Result<&'a [u8]> {
    let slice = pos
        .checked_add(n)
        .and_then(|end| block.get(*pos..end))
        .ok_or_else(|| Error::corruption(file, "index block truncated"))?;
    *pos += n;
    Ok(slice)
}

fn fixed<const N: usize>(block: &[u8], pos: &mut usize, file: &str) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(block, pos, N, file)?);
    Ok(out)
}

/// Decode `[LEN][payload][CRC]` into a partition.
fn decode_record(record: &[u8], path: &Path) -> Result<Partition> {
    let name = || path.display().to_string();
    if record.len() < 8 {
        return Err(Error::corruption(name(), "record truncated"));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&record[..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if record.len() != len + 8 {
        return Err(Error::corruption(name(), "record length mismatch"));
    }
    let payload = &record[4..4 + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&record[4 + len..]);
    let expected = u32::from_le_bytes(crc_bytes);
    let actual = crc32(payload);
    if expected != actual {
        return Err(Error::corruption(
            name(),
            format!("record checksum mismatch: expected {:08x}, got {:08x}", expected, actual),
        ));
    }
    bincode::deserialize(payload).map_err(|e| Error::corruption(name(), e.to_string()))
}

/// Iterator over a table's data section.
pub struct SsTableScanner {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: u64,
}

impl SsTableScanner {
    fn read_next(&mut self) -> Result<Partition> {
        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as u64;
        if len + 8 > self.remaining {
            return Err(Error::corruption(
                self.path.display().to_string(),
                "record runs past data section",
            ));
        }
        let mut record = vec![0u8; len as usize + 8];
        record[..4].copy_from_slice(&len_bytes);
        self.reader.read_exact(&mut record[4..])?;
        self.remaining -= len + 8;
        decode_record(&record, &self.path)
    }
}

impl Iterator for SsTableScanner {
    type Item = Result<Partition>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.read_next() {
            Ok(partition) => Some(Ok(partition)),
            Err(e) => {
                // one error ends the scan
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(n: usize) -> Vec<Partition> {
        let mut parts: Vec<Partition> = (0..n)
            .map(|i| Partition::upsert(format!("key-{:04}", i), "", [("v", format!("{}", i))], i as i64 + 10))
            .collect();
        parts.sort_by(|a, b| a.key.cmp(&b.key));
        parts
    }

    fn write(dir: &Path, id: u64, parts: Vec<Partition>) -> SsTable {
        let n = parts.len();
        write_sstable(dir, id, parts.into_iter().map(Ok), n, FilterKind::Bloom, 0.01)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_write_and_point_lookup() {
        let dir = tempdir().unwrap();
        let table = write(dir.path(), 1, sample(100));

        assert_eq!(table.meta().partition_count, 100);
        assert_eq!(table.meta().min_timestamp, Some(10));
        assert_eq!(table.meta().max_timestamp, Some(109));

        let p = table.get(b"key-0042").unwrap().unwrap();
        assert_eq!(p.live_rows()[0].get("v"), Some(&b"42"[..]));
        assert!(table.get(b"missing").unwrap().is_none());
        assert!(table.may_contain(b"key-0042"));

        // reopen from disk
        let reopened = SsTable::open(&table_path(dir.path(), 1), 1).unwrap();
        assert_eq!(reopened.meta(), table.meta());
        assert!(!dir.path().join("sst-1.db.tmp").exists());
    }

    #[test]
    fn test_scan_in_key_order() {
        let dir = tempdir().unwrap();
        let table = write(dir.path(), 2, sample(20));
        let keys: Vec<Vec<u8>> = table.scan().unwrap().map(|p| p.unwrap().key).collect();
        assert_eq!(keys.len(), 20);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(table.verify().unwrap(), 20);
    }

    #[test]
    fn test_empty_input_writes_nothing() {
        let dir = tempdir().unwrap();
        let result = write_sstable(dir.path(), 3, Vec::<Result<Partition>>::new(), 0, FilterKind::Bloom, 0.01).unwrap();
        assert!(result.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unsorted_input_rejected() {
        let dir = tempdir().unwrap();
        let mut parts = sample(3);
        parts.reverse();
        let result = write_sstable(dir.path(), 4, parts.into_iter().map(Ok), 3, FilterKind::Bloom, 0.01);
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_record_detected() {
        let dir = tempdir().unwrap();
        let table = write(dir.path(), 5, sample(10));
        let path = table.path().to_path_buf();

        // flip a byte inside the first record's payload
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = table.get(b"key-0000").unwrap_err();
        assert!(matches!(err, Error::CorruptionDetected { .. }));
        assert!(table.verify().is_err());
    }

    #[test]
    fn test_corrupt_footer_rejected_on_open() {
        let dir = tempdir().unwrap();
        let table = write(dir.path(), 6, sample(5));
        let path = table.path().to_path_buf();
        drop(table);

        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 20] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            SsTable::open(&path, 6),
            Err(Error::CorruptionDetected { .. })
        ));
    }

    #[test]
    fn test_footer_offsets_overflowing_rejected() {
        let dir = tempdir().unwrap();
        let table = write(dir.path(), 8, sample(5));
        let path = table.path().to_path_buf();
        drop(table);

        // well-formed footer whose index range wraps around u64
        let mut bytes = std::fs::read(&path).unwrap();
        let start = bytes.len() - Footer::SIZE;
        let mut footer = Footer::decode(&bytes[start..], "sst-8.db").unwrap();
        footer.index_offset = u64::MAX - 1;
        footer.index_len = footer.filter_offset.wrapping_sub(footer.index_offset);
        bytes.truncate(start);
        bytes.extend_from_slice(&footer.encode());
        std::fs::write(&path, &bytes).unwrap();

        match SsTable::open(&path, 8) {
            Err(Error::CorruptionDetected { reason, .. }) => {
                assert!(reason.contains("out of range"))
            }
            other => panic!("unexpected {:?}", other.map(|t| t.id())),
        }
    }

    #[test]
    fn test_obsolete_table_deleted_on_drop() {
        let dir = tempdir().unwrap();
        let table = write(dir.path(), 7, sample(2));
        let path = table.path().to_path_buf();
        table.mark_obsolete();
        assert!(table.is_retired());
        assert!(path.exists());
        drop(table);
        assert!(!path.exists());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(parse_table_name("sst-12.db"), Some(12));
        assert_eq!(parse_table_name("sst-12.db.tmp"), None);
        assert_eq!(parse_table_name("MANIFEST"), None);
        assert!(is_tmp_name("sst-3.db.tmp"));
    }
}
