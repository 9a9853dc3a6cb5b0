//! CLI for a local ringkv node

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ringkv::common::{format_bytes, NodeId};
use ringkv::node::StorageNode;
use ringkv::ops::{compact_node, verify_node};
use ringkv::{Config, ConsistencyLevel, LocalNetwork};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "ringkv")]
#[command(about = "ringkv replicated wide-column storage node")]
#[command(version)]
struct Cli {
    /// TOML config file (RINGKV__* environment variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write columns of one row
    Put {
        /// Partition key
        key: String,

        /// Columns as name=value
        #[arg(required = true, value_parser = parse_column)]
        columns: Vec<(String, String)>,

        /// Clustering key of the row
        #[arg(long, default_value = "")]
        row: String,

        /// Write timestamp in microseconds (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Read a partition or one row
    Get {
        /// Partition key
        key: String,

        /// Clustering key of the row
        #[arg(long)]
        row: Option<String>,
    },

    /// Delete columns, a row or a whole partition
    Delete {
        /// Partition key
        key: String,

        /// Columns to delete (all if omitted)
        columns: Vec<String>,

        /// Clustering key of the row
        #[arg(long)]
        row: Option<String>,

        /// Tombstone timestamp in microseconds (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Flush and merge every sstable into one
    Compact,

    /// Checksum every sstable, quarantining corrupt ones
    Verify,

    /// Show memtable, sstable and hint state
    Inspect {
        /// Also print metrics in Prometheus format
        #[arg(long)]
        metrics: bool,
    },

    /// Run three nodes in process: a quorum write with one replica down,
    /// then hinted handoff once it returns
    Simulate {
        /// Consistency level of the write
        #[arg(long, default_value = "QUORUM")]
        consistency: ConsistencyLevel,
    },
}

fn parse_column(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Commands::Simulate { consistency } = cli.command {
        return simulate(config.data_dir.join("simulation"), consistency).await;
    }

    // Local commands operate on a single-replica node
    config.cluster.replication_factor = 1;
    config.cluster.seeds.clear();
    let node = open_local(config)?;
    let one = ConsistencyLevel::One;

    match cli.command {
        Commands::Put {
            key,
            columns,
            row,
            timestamp,
        } => {
            node.put(key, row, columns, timestamp, one).await?;
            println!("OK");
        }

        Commands::Get { key, row } => {
            let rows = node.get(key, row.map(String::into_bytes), one).await?;
            for row in rows {
                println!("[{}]", String::from_utf8_lossy(&row.clustering_key));
                for (name, value) in &row.columns {
                    println!("  {} = {}", name, String::from_utf8_lossy(value));
                }
            }
        }

        Commands::Delete {
            key,
            columns,
            row,
            timestamp,
        } => {
            node.delete(key, row.map(String::into_bytes), columns, timestamp, one)
                .await?;
            println!("OK");
        }

        Commands::Compact => {
            let report = compact_node(node.engine()).await?;
            println!("Compaction report:");
            println!("  SSTables: {} -> {}", report.tables_before, report.tables_after);
            println!("  Partitions written: {}", report.partitions_written);
            println!("  Partitions purged: {}", report.partitions_purged);
            println!("  Bytes freed: {}", format_bytes(report.bytes_freed));
        }

        Commands::Verify => {
            let report = verify_node(node.engine()).await?;
            println!("Verification report:");
            println!("  SSTables checked: {}", report.tables_checked);
            println!("  Partitions checked: {}", report.partitions_checked);
            println!("  Quarantined: {:?}", report.quarantined);
            if !report.quarantined.is_empty() {
                node.shutdown()?;
                bail!("{} corrupt sstable(s) quarantined", report.quarantined.len());
            }
        }

        Commands::Inspect { metrics } => {
            let stats = node.engine().stats();
            println!("Node {} ({})", node.id(), node.config().data_dir.display());
            println!(
                "  Memtable: {} partitions, {}",
                stats.memtable_partitions,
                format_bytes(stats.memtable_bytes as u64)
            );
            println!("  Frozen memtables: {}", stats.frozen_memtables);
            println!("  Commit log segment: {}", stats.commitlog_segment);
            println!("  SSTables: {}", stats.sstables.len());
            for meta in &stats.sstables {
                println!(
                    "    #{:<6} {:>10}  {} partitions  ts {:?}..{:?}",
                    meta.id,
                    format_bytes(meta.file_size),
                    meta.partition_count,
                    meta.min_timestamp,
                    meta.max_timestamp
                );
            }
            println!("  Pending hints: {}", node.hints().count());
            if metrics {
                print!("{}", node.metrics().to_prometheus());
            }
        }

        Commands::Simulate { .. } => unreachable!("handled above"),
    }

    node.shutdown()?;
    Ok(())
}

fn open_local(config: Config) -> Result<Arc<StorageNode>> {
    let network = LocalNetwork::new();
    let id = config.node_id.clone();
    let node = StorageNode::open(config, network.transport_for(id.clone()))
        .context("failed to open node")?;
    network.register(id, node.clone());
    Ok(node)
}

async fn simulate(root: PathBuf, consistency: ConsistencyLevel) -> Result<()> {
    if root.exists() {
        std::fs::remove_dir_all(&root)?;
    }

    let network = LocalNetwork::new();
    let ids: Vec<NodeId> = ["node-a", "node-b", "node-c"].into_iter().map(NodeId::new).collect();
    let mut nodes = Vec::new();
    for id in &ids {
        let mut config = Config::for_node(id.as_str(), root.join(id.as_str()));
        config.cluster.replication_factor = 3;
        config.cluster.seeds = ids.clone();
        config.cluster.gossip_fanout = 2;
        let node = StorageNode::open(config, network.transport_for(id.clone()))?;
        network.register(id.clone(), node.clone());
        nodes.push(node);
    }

    for _ in 0..5 {
        for node in &nodes {
            node.gossip_round().await;
        }
    }
    let replicas = nodes[0].membership().view().replicas_for(b"u1");
    println!("Replicas of u1: {:?}", replicas);
    if replicas.len() != 3 {
        bail!("ring did not converge: {} replicas", replicas.len());
    }

    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    network.set_down(b.id(), true);
    println!("{} is down", b.id());

    a.put("u1", "", [("name", "Alice")], Some(100), consistency)
        .await
        .context("write failed")?;
    println!("PUT u1 name=Alice at {} succeeded", consistency);

    // hints are stored once the failed replica request completes
    let mut waited = Duration::ZERO;
    while a.hints().count() == 0 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    println!("Hints queued on {}: {}", a.id(), a.hints().count());

    network.set_down(b.id(), false);
    println!("{} rejoins", b.id());
    for _ in 0..3 {
        for node in &nodes {
            node.gossip_round().await;
        }
    }
    let report = a.replay_hints().await?;
    println!(
        "Hint replay: {} delivered, {} dropped, {} remaining",
        report.delivered, report.dropped, report.remaining
    );

    network.set_down(a.id(), true);
    network.set_down(c.id(), true);
    match b.get("u1", None, ConsistencyLevel::One).await {
        Ok(rows) => {
            for row in rows {
                for (name, value) in &row.columns {
                    println!("GET u1 from {} alone: {} = {}", b.id(), name, String::from_utf8_lossy(value));
                }
            }
        }
        Err(e) => println!("GET u1 from {} alone failed: {}", b.id(), e),
    }

    for node in &nodes {
        node.shutdown()?;
    }
    Ok(())
}
