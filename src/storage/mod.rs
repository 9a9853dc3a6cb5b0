//! Local LSM storage: commit log, memtables, sstables and compaction

pub mod commitlog;
pub mod compaction;
pub mod engine;
pub mod filter;
pub mod manifest;
pub mod memtable;
pub mod sstable;

pub use compaction::{CompactionManager, CompactionReport};
pub use engine::{EngineStats, EngineVerifyReport, StorageEngine};
pub use filter::{FilterKind, MembershipFilter};
pub use sstable::{SsTable, SsTableMeta};
