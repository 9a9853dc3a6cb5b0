//! Common utilities and types shared across ringkv

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod model;
pub mod utils;

pub use config::{ClusterConfig, CommitLogSync, Config, ReplicationConfig, StorageConfig};
pub use error::{Error, Result};
pub use hash::{token_for, vnode_tokens};
pub use metrics::NodeMetrics;
pub use model::{
    Cell, Deletion, LocalTime, Mutation, NodeId, Partition, ReadCommand, Row, RowData, Timestamp,
    Token,
};
pub use utils::{crc32, format_bytes, parse_duration, timestamp_now_micros, timestamp_now_millis};
