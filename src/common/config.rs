//! Configuration for a ringkv node
//!
//! Layered as defaults <- optional TOML file <- `RINGKV__*` environment
//! variables (`RINGKV__CLUSTER__REPLICATION_FACTOR=5`). Durations are
//! written as human strings such as `"500ms"` or `"10d"`.

use crate::common::model::NodeId;
use crate::common::utils::duration_str;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: NodeId,

    /// Root directory for commit log, sstables and hints
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fault domain used to spread replicas
    #[serde(default)]
    pub rack: Option<String>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,
}

fn default_node_id() -> NodeId {
    NodeId::new("node-1")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./ringkv-data")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: default_data_dir(),
            rack: None,
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            cluster: ClusterConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl Config {
    /// Defaults for a node rooted at `data_dir`.
    pub fn for_node(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load config: defaults, then the TOML file if given, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RINGKV")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("cluster.seeds"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.as_str().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.cluster.replication_factor == 0 {
            return Err(Error::InvalidConfig(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.cluster.num_vnodes == 0 {
            return Err(Error::InvalidConfig("num_vnodes must be at least 1".into()));
        }
        if self.cluster.gossip_interval.is_zero() {
            return Err(Error::InvalidConfig("gossip_interval must be > 0".into()));
        }
        if self.cluster.dead_timeout
            <= self.cluster.gossip_interval * self.cluster.suspect_after_intervals
        {
            return Err(Error::InvalidConfig(
                "dead_timeout must be longer than the suspect threshold".into(),
            ));
        }
        if !(self.storage.bloom_fp_rate > 0.0 && self.storage.bloom_fp_rate < 1.0) {
            return Err(Error::InvalidConfig(
                "bloom_fp_rate must be in (0, 1)".into(),
            ));
        }
        if self.storage.compaction_threshold < 2 {
            return Err(Error::InvalidConfig(
                "compaction_threshold must be at least 2".into(),
            ));
        }
        if self.storage.memtable_flush_threshold == 0 {
            return Err(Error::InvalidConfig(
                "memtable_flush_threshold must be > 0".into(),
            ));
        }
        if self.replication.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request_timeout must be > 0".into()));
        }
        Ok(())
    }

    pub fn commitlog_dir(&self) -> PathBuf {
        self.data_dir.join("commitlog")
    }

    pub fn sstable_dir(&self) -> PathBuf {
        self.data_dir.join("data")
    }

    pub fn hints_dir(&self) -> PathBuf {
        self.data_dir.join("hints")
    }

    /// Corrupt sstables are moved here for an operator to inspect.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_dir.join("quarantine")
    }
}

/// Commit log sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitLogSync {
    /// fsync after every append
    Always,
    /// flush to the OS after every append, fsync on rotation
    Batch,
    /// leave it to the OS
    Never,
}

/// LSM storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Memtable size (bytes) that triggers a freeze and flush
    pub memtable_flush_threshold: usize,

    /// Commit log segment size (bytes) before rotation
    pub commitlog_segment_size: u64,

    pub commitlog_sync: CommitLogSync,

    /// Similar-sized sstables needed before a compaction runs
    pub compaction_threshold: usize,

    /// How often the compaction task looks for work
    #[serde(with = "duration_str")]
    pub compaction_interval: Duration,

    /// How long tombstones survive before compaction may purge them
    #[serde(with = "duration_str")]
    pub tombstone_grace: Duration,

    /// Target false-positive rate of each sstable's membership filter
    pub bloom_fp_rate: f64,

    /// Attempts for a failing flush or compaction before giving up a cycle
    pub flush_retries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memtable_flush_threshold: 4 * 1024 * 1024,
            commitlog_segment_size: 8 * 1024 * 1024,
            commitlog_sync: CommitLogSync::Always,
            compaction_threshold: 4,
            compaction_interval: Duration::from_secs(30),
            tombstone_grace: Duration::from_secs(10 * 86400),
            bloom_fp_rate: 0.01,
            flush_retries: 5,
        }
    }
}

/// Membership and partitioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Replication factor (N)
    pub replication_factor: usize,

    /// Virtual nodes (tokens) per physical node
    pub num_vnodes: usize,

    /// Nodes contacted to join the gossip network
    pub seeds: Vec<NodeId>,

    #[serde(with = "duration_str")]
    pub gossip_interval: Duration,

    /// Live peers contacted per gossip round
    pub gossip_fanout: usize,

    /// Missed gossip intervals before a peer becomes suspect
    pub suspect_after_intervals: u32,

    /// Silence after which a peer is considered dead
    #[serde(with = "duration_str")]
    pub dead_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            num_vnodes: 16,
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            gossip_fanout: 2,
            suspect_after_intervals: 3,
            dead_timeout: Duration::from_secs(10),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Per-replica RPC deadline
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Store hints for replicas that miss a successful write
    pub hinted_handoff: bool,

    /// Hints older than this are dropped; the replica needs a full repair
    #[serde(with = "duration_str")]
    pub hint_retention: Duration,

    #[serde(with = "duration_str")]
    pub hint_replay_interval: Duration,

    /// How long late read responses are still used for read repair
    #[serde(with = "duration_str")]
    pub read_repair_grace: Duration,

    /// Attempts per stale replica for one read repair
    pub read_repair_attempts: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            hinted_handoff: true,
            hint_retention: Duration::from_secs(3 * 3600),
            hint_replay_interval: Duration::from_secs(10),
            read_repair_grace: Duration::from_millis(200),
            read_repair_attempts: 3,
        }
    }
}
