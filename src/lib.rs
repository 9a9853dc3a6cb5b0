//! # ringkv
//!
//! A replicated wide-column storage node:
//! - Consistent-hash partitioning with virtual nodes and rack-aware placement
//! - Gossip membership with heartbeat liveness detection
//! - Tunable consistency (ONE / QUORUM / ALL) with hinted handoff
//! - Timestamp reconciliation and read repair
//! - LSM storage: commit log, memtables, sstables with membership filters,
//!   size-tiered compaction and tombstone garbage collection
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            client put / get / delete
//!                       │
//! ┌─────────────────────▼─────────────────────────┐
//! │ StorageNode                                   │
//! │  Coordinator ── ConsistencyLevel, resolver    │
//! │      │   hints (per target, on disk)          │
//! │      │                                        │
//! │  Membership ── gossip ── RingView snapshot    │
//! │      │                                        │
//! │  StorageEngine: commit log → memtable → SSTs  │
//! └──────┬────────────────────────────────────────┘
//!        │ PeerRequest / PeerResponse
//!   ┌────┴───────┬──────────────┐
//!   ▼            ▼              ▼
//!  node B       node C         node D
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Write and read against a local single-replica data directory
//! ringkv --data-dir ./data put u1 name=Alice
//! ringkv --data-dir ./data get u1
//!
//! # Maintenance
//! ringkv --data-dir ./data compact
//! ringkv --data-dir ./data verify
//!
//! # Three in-process nodes, one down during a quorum write
//! ringkv --data-dir ./sim simulate
//! ```

pub mod cluster;
pub mod common;
pub mod coordinator;
pub mod node;
pub mod ops;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{ConsistencyLevel, LocalNetwork};
pub use node::StorageNode;
pub use storage::StorageEngine;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
