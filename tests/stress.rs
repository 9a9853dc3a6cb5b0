//! Stress test for a ringkv cluster: sustained writes and reads

mod common;

use common::TestCluster;
use ringkv::common::{Config, NodeMetrics, Partition, ReadCommand};
use ringkv::{ConsistencyLevel, StorageEngine};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

#[test]
fn stress_engine_write_read() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::for_node("n1", dir.path());
    config.storage.memtable_flush_threshold = 64 * 1024;
    let engine = StorageEngine::open(&config, Arc::new(NodeMetrics::new())).unwrap();

    let n = if cfg!(feature = "heavy-tests") { 50_000 } else { 2_000 };
    let start = Instant::now();
    for i in 0..n {
        engine
            .write(Partition::upsert(format!("key_{}", i), "", [("v", "stress_value")], i))
            .unwrap();
        if i % 500 == 499 {
            engine.flush_frozen().unwrap();
            if let Some(report) = engine.compact().unwrap() {
                assert!(report.output.is_some());
            }
        }
    }
    let write_time = start.elapsed();

    let start = Instant::now();
    for i in 0..n {
        let p = engine
            .read(&ReadCommand::partition(format!("key_{}", i)))
            .unwrap()
            .unwrap();
        assert_eq!(p.live_rows()[0].get("v"), Some(&b"stress_value"[..]));
    }
    let read_time = start.elapsed();

    println!(
        "{} writes in {:?}, {} reads in {:?}, {} sstables",
        n,
        write_time,
        n,
        read_time,
        engine.stats().sstables.len()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_concurrent_quorum_writes() {
    let cluster = TestCluster::start(&["a", "b", "c"], 3);
    cluster.converge().await;

    let n = if cfg!(feature = "heavy-tests") { 2_000 } else { 200 };
    let mut handles = Vec::new();
    for (w, node) in cluster.nodes.iter().enumerate() {
        let node = node.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..n {
                node.put(
                    format!("w{}-{}", w, i),
                    "",
                    [("v", format!("{}", i))],
                    None,
                    ConsistencyLevel::Quorum,
                )
                .await
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for w in 0..cluster.nodes.len() {
        for i in (0..n).step_by(17) {
            let rows = cluster.nodes[(w + 1) % 3]
                .get(format!("w{}-{}", w, i), None, ConsistencyLevel::Quorum)
                .await
                .unwrap();
            assert_eq!(rows[0].get("v"), Some(format!("{}", i).as_bytes()));
        }
    }
}
