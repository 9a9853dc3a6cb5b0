//! Compaction idempotence and tombstone garbage collection

use ringkv::common::{
    timestamp_now_micros, timestamp_now_millis, Config, NodeMetrics, Partition, ReadCommand,
};
use ringkv::StorageEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const KEYS: usize = 50;

fn open(config: &Config) -> StorageEngine {
    StorageEngine::open(config, Arc::new(NodeMetrics::new())).unwrap()
}

/// Three flushed generations of overlapping writes plus some deletes.
fn populate(engine: &StorageEngine) {
    for round in 0..3i64 {
        for i in 0..KEYS {
            engine
                .write(Partition::upsert(
                    format!("k{}", i),
                    format!("r{}", i % 3),
                    [("v", format!("{}-{}", i, round))],
                    round * 100 + i as i64,
                ))
                .unwrap();
        }
        engine.flush().unwrap();
    }
    for i in (0..KEYS).step_by(7) {
        engine
            .write(Partition::partition_deletion(format!("k{}", i), 1_000))
            .unwrap();
    }
    engine.flush().unwrap();
}

fn visible(engine: &StorageEngine) -> Vec<Vec<ringkv::common::Row>> {
    (0..KEYS)
        .map(|i| {
            engine
                .read(&ReadCommand::partition(format!("k{}", i)))
                .unwrap()
                .map(|p| p.live_rows())
                .unwrap_or_default()
        })
        .collect()
}

fn table_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "db"))
        .collect()
}

#[test]
fn test_compacting_twice_is_idempotent() {
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let reference = open(&Config::for_node("n1", dir_a.path()));
    let compacted = open(&Config::for_node("n1", dir_b.path()));
    populate(&reference);
    populate(&compacted);

    compacted.major_compact().unwrap();
    let once = visible(&compacted);
    compacted.major_compact().unwrap();
    let twice = visible(&compacted);

    assert_eq!(once, twice);
    assert_eq!(once, visible(&reference));
    assert_eq!(compacted.stats().sstables.len(), 1);
}

#[test]
fn test_crash_before_manifest_commit_loses_nothing() {
    let dir = TempDir::new().unwrap();
    let config = Config::for_node("n1", dir.path());
    let expected = {
        let engine = open(&config);
        populate(&engine);
        visible(&engine)
    };

    // a compaction output that never made it into the manifest
    let tables = table_files(&config.sstable_dir());
    std::fs::copy(&tables[0], config.sstable_dir().join("sst-9999.db")).unwrap();

    let engine = open(&config);
    assert!(!config.sstable_dir().join("sst-9999.db").exists());
    assert_eq!(visible(&engine), expected);
    engine.major_compact().unwrap();
    assert_eq!(visible(&engine), expected);
}

#[test]
fn test_purged_tombstone_does_not_resurrect_after_crash() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::for_node("n1", dir.path());
    config.storage.tombstone_grace = Duration::ZERO;

    let saved = TempDir::new().unwrap();
    {
        let engine = open(&config);
        engine.write(Partition::upsert("x", "", [("c", "1")], 5)).unwrap();
        engine.flush().unwrap();
        engine
            .write(Partition::column_deletion("x", "", ["c"], 10))
            .unwrap();
        engine.flush().unwrap();

        // keep the pre-compaction tables around
        for path in table_files(&config.sstable_dir()) {
            std::fs::copy(&path, saved.path().join(path.file_name().unwrap())).unwrap();
        }

        let report = engine.major_compact().unwrap().unwrap();
        assert_eq!(report.partitions_purged, 1);
        assert!(engine
            .read(&ReadCommand::partition("x"))
            .unwrap()
            .map_or(true, |p| p.live_rows().is_empty()));
    }

    // the inputs reappear as if their deletion never happened
    for path in table_files(saved.path()) {
        std::fs::copy(&path, config.sstable_dir().join(path.file_name().unwrap())).unwrap();
    }

    let engine = open(&config);
    let data = engine.read(&ReadCommand::partition("x")).unwrap();
    assert!(data.map(|p| p.live_rows().is_empty()).unwrap_or(true));
}

#[test]
fn test_tombstones_survive_compaction_within_grace() {
    let dir = TempDir::new().unwrap();
    let config = Config::for_node("n1", dir.path());
    let engine = open(&config);
    let now = timestamp_now_micros();

    engine.write(Partition::upsert("x", "", [("c", "1")], now - 5)).unwrap();
    engine.flush().unwrap();
    engine
        .write(Partition::column_deletion("x", "", ["c"], now))
        .unwrap();
    engine.flush().unwrap();

    let report = engine.major_compact().unwrap().unwrap();
    assert_eq!(report.partitions_purged, 0);
    let data = engine.read(&ReadCommand::partition("x")).unwrap().unwrap();
    assert!(data.live_rows().is_empty());
    assert!(data.rows.values().any(|row| row.cells.values().any(|c| c.is_tombstone())));
}

#[test]
fn test_logical_timestamps_do_not_expire_tombstones() {
    let dir = TempDir::new().unwrap();
    let config = Config::for_node("n1", dir.path());
    let engine = open(&config);

    engine.write(Partition::upsert("x", "", [("c", "1")], 5)).unwrap();
    engine.flush().unwrap();
    engine
        .write(Partition::column_deletion("x", "", ["c"], 10))
        .unwrap();
    engine
        .write(Partition::row_deletion("y", "r", 3))
        .unwrap();
    engine.flush().unwrap();

    let report = engine.major_compact().unwrap().unwrap();
    assert_eq!(report.partitions_purged, 0);
    assert_eq!(report.partitions_written, 2);

    // a lagging replica pushes the value the delete superseded
    engine.write(Partition::upsert("x", "", [("c", "1")], 5)).unwrap();
    engine.flush().unwrap();
    engine.major_compact().unwrap();

    let data = engine.read(&ReadCommand::partition("x")).unwrap().unwrap();
    assert!(data.live_rows().is_empty());
}

#[test]
fn test_tombstones_survive_restart_with_their_local_time() {
    let dir = TempDir::new().unwrap();
    let config = Config::for_node("n1", dir.path());
    let before = timestamp_now_millis() as i64;
    {
        let engine = open(&config);
        engine.write(Partition::partition_deletion("x", 10)).unwrap();
        engine.sync().unwrap();
    }

    // replayed from the commit log, not restamped
    let engine = open(&config);
    let data = engine.read(&ReadCommand::partition("x")).unwrap().unwrap();
    let deletion = data.deletion.unwrap();
    assert_eq!(deletion.timestamp, 10);
    assert!(deletion.local_time >= before);
    assert!(deletion.local_time <= timestamp_now_millis() as i64);
}
