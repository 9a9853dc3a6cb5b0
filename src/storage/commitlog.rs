//! Segmented commit log
//!
//! Every mutation is appended here before it touches the memtable; crash
//! recovery replays the segments that are not yet covered by sstables.
//!
//! Record format: [MAGIC][SEQUENCE][LEN][PAYLOAD][CRC32]
//!
//! The payload is a bincode-encoded `Partition`. The CRC covers sequence,
//! length and payload. Segments are named `CommitLog-<id>.log` and are
//! rotated by size and on every memtable freeze. A reopened log always
//! starts a fresh segment so new records never land behind a torn tail.

use crate::common::{crc32, CommitLogSync, Error, Mutation, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const RECORD_MAGIC: [u8; 4] = [0x52, 0x4B, 0x43, 0x31]; // "RKC1"
const SEGMENT_PREFIX: &str = "CommitLog-";
const SEGMENT_SUFFIX: &str = ".log";

/// Refuse to allocate for a length field larger than this.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// One replayed commit log record.
#[derive(Debug, Clone)]
pub struct CommitLogEntry {
    pub segment: u64,
    pub sequence: u64,
    pub mutation: Mutation,
}

/// What a replay found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub segments: usize,
    pub entries: usize,
    /// Segments whose replay stopped at a torn or corrupt record
    pub torn_segments: usize,
}

pub struct CommitLog {
    dir: PathBuf,
    writer: BufWriter<File>,
    segment_id: u64,
    segment_bytes: u64,
    max_segment_bytes: u64,
    next_sequence: u64,
    sync_policy: CommitLogSync,
    /// Set after a failed append: the segment may end in a partial record.
    needs_rotation: bool,
}

impl CommitLog {
    /// Open the log directory and start a new segment after the newest one.
    pub fn open(
        dir: impl AsRef<Path>,
        max_segment_bytes: u64,
        sync_policy: CommitLogSync,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let next_sequence = Self::find_next_sequence(&segments);
        let segment_id = segments.last().map(|(id, _)| id + 1).unwrap_or(0);
        let writer = Self::create_segment(&dir, segment_id)?;

        tracing::debug!(
            "Commit log opened at {} (segment {}, next sequence {})",
            dir.display(),
            segment_id,
            next_sequence
        );

        Ok(Self {
            dir,
            writer,
            segment_id,
            segment_bytes: 0,
            max_segment_bytes,
            next_sequence,
            sync_policy,
            needs_rotation: false,
        })
    }

    fn create_segment(dir: &Path, id: u64) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, id))?;
        Ok(BufWriter::new(file))
    }

    /// Highest sequence number found in the newest readable segment, plus one.
    fn find_next_sequence(segments: &[(u64, PathBuf)]) -> u64 {
        for (_, path) in segments.iter().rev() {
            let Ok(file) = File::open(path) else {
                continue;
            };
            let mut reader = BufReader::new(file);
            let mut max_seq = None;
            while let Ok(Some((sequence, _))) = read_record(&mut reader) {
                max_seq = Some(max_seq.unwrap_or(0).max(sequence));
            }
            if let Some(seq) = max_seq {
                return seq + 1;
            }
        }
        0
    }

    /// Append a mutation. Returns the sequence number assigned to it.
    pub fn append(&mut self, mutation: &Mutation) -> Result<u64> {
        if self.needs_rotation || self.segment_bytes >= self.max_segment_bytes {
            self.rotate()?;
        }

        let payload = bincode::serialize(mutation)?;
        let sequence = self.next_sequence;
        let record = encode_record(sequence, &payload);

        let written = self
            .writer
            .write_all(&record)
            .and_then(|_| self.sync_after_append());
        if let Err(e) = written {
            self.needs_rotation = true;
            return Err(e.into());
        }

        self.next_sequence += 1;
        self.segment_bytes += record.len() as u64;
        Ok(sequence)
    }

    fn sync_after_append(&mut self) -> std::io::Result<()> {
        match self.sync_policy {
            CommitLogSync::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_data()
            }
            CommitLogSync::Batch => self.writer.flush(),
            CommitLogSync::Never => Ok(()),
        }
    }

    /// Seal the current segment and start the next one. Returns the new
    /// segment id; everything appended from now on lands in it or later.
    pub fn rotate(&mut self) -> Result<u64> {
        self.sync()?;
        let next_id = self.segment_id + 1;
        self.writer = Self::create_segment(&self.dir, next_id)?;
        self.segment_id = next_id;
        self.segment_bytes = 0;
        self.needs_rotation = false;
        tracing::debug!("Commit log rotated to segment {}", next_id);
        Ok(next_id)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn current_segment(&self) -> u64 {
        self.segment_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete sealed segments with an id below `low_water`.
    pub fn delete_segments_below(&self, low_water: u64) -> Result<usize> {
        let mut deleted = 0;
        for (id, path) in list_segments(&self.dir)? {
            if id >= low_water || id >= self.segment_id {
                continue;
            }
            std::fs::remove_file(&path)?;
            deleted += 1;
        }
        if deleted > 0 {
            tracing::debug!("Deleted {} commit log segment(s) below {}", deleted, low_water);
        }
        Ok(deleted)
    }

    /// Replay every segment with id >= `from_segment`, oldest first.
    ///
    /// A torn or corrupt record ends the replay of its segment (it can only
    /// be the tail written during a crash); later segments are still read.
    pub fn replay<F>(dir: impl AsRef<Path>, from_segment: u64, mut callback: F) -> Result<ReplayStats>
    where
        F: FnMut(CommitLogEntry) -> Result<()>,
    {
        let mut stats = ReplayStats::default();
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(stats);
        }

        for (segment, path) in list_segments(dir)? {
            if segment < from_segment {
                continue;
            }
            stats.segments += 1;
            let mut reader = BufReader::new(File::open(&path)?);
            loop {
                match read_record(&mut reader) {
                    Ok(Some((sequence, payload))) => {
                        let mutation: Mutation = match bincode::deserialize(&payload) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::warn!(
                                    "Commit log replay of {} stopped at undecodable record {}: {}",
                                    path.display(),
                                    sequence,
                                    e
                                );
                                stats.torn_segments += 1;
                                break;
                            }
                        };
                        stats.entries += 1;
                        callback(CommitLogEntry {
                            segment,
                            sequence,
                            mutation,
                        })?;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(
                            "Commit log replay of {} stopped at corrupted record: {}",
                            path.display(),
                            e
                        );
                        stats.torn_segments += 1;
                        break;
                    }
                }
            }
        }

        Ok(stats)
    }
}

pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX))
}

/// Segments in `dir`, sorted by id.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let id = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|id| id.parse::<u64>().ok());
        if let Some(id) = id {
            segments.push((id, entry.path()));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Frame one record. Also used by the hint store.
pub(crate) fn encode_record(sequence: u64, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut record = Vec::with_capacity(4 + 8 + 4 + payload.len() + 4);
    record.extend_from_slice(&RECORD_MAGIC);
    record.extend_from_slice(&sequence.to_le_bytes());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(payload);

    let checksum = crc32(&record[4..]);
    record.extend_from_slice(&checksum.to_le_bytes());
    record
}

/// Read one framed record; `Ok(None)` at a clean end of file.
pub(crate) fn read_record<R: Read>(reader: &mut R) -> Result<Option<(u64, Vec<u8>)>> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if magic != RECORD_MAGIC {
        return Err(Error::Serialization("invalid record magic".into()));
    }

    let mut header = [0u8; 12];
    reader.read_exact(&mut header)?;
    let sequence = u64::from_le_bytes([
        header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
    ]);
    let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if len > MAX_RECORD_LEN {
        return Err(Error::Serialization(format!("record length {} too large", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&payload);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(Some((sequence, payload)))
}
