//! Recovery tests: crash and restart of the storage engine

use ringkv::common::{Config, NodeMetrics, Partition, ReadCommand};
use ringkv::StorageEngine;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

fn open(config: &Config) -> StorageEngine {
    StorageEngine::open(config, Arc::new(NodeMetrics::new())).unwrap()
}

fn snapshot(engine: &StorageEngine, keys: usize) -> Vec<Option<Partition>> {
    (0..keys)
        .map(|i| engine.read(&ReadCommand::partition(format!("key_{}", i))).unwrap())
        .collect()
}

#[test]
fn test_recovery_after_crash() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::for_node("n1", dir.path());
    config.storage.memtable_flush_threshold = 4 * 1024;

    let before = {
        let engine = open(&config);
        for i in 0..300 {
            engine
                .write(Partition::upsert(format!("key_{}", i), "", [("v", format!("value_{}", i))], i))
                .unwrap();
            if i % 100 == 99 {
                engine.flush().unwrap();
            }
        }
        engine
            .write(Partition::column_deletion("key_7", "", ["v"], 1_000))
            .unwrap();
        snapshot(&engine, 300)
        // dropped without a final flush
    };

    let engine = open(&config);
    assert_eq!(snapshot(&engine, 300), before);
    assert!(engine
        .read(&ReadCommand::partition("key_7"))
        .unwrap()
        .unwrap()
        .live_rows()
        .is_empty());
}

#[test]
fn test_torn_commitlog_tail_is_ignored() {
    let dir = TempDir::new().unwrap();
    let config = Config::for_node("n1", dir.path());
    {
        let engine = open(&config);
        engine.write(Partition::upsert("a", "", [("v", "1")], 1)).unwrap();
        engine.write(Partition::upsert("b", "", [("v", "2")], 2)).unwrap();
        engine.sync().unwrap();
    }

    // half-written record at the end of the newest segment
    let mut segments: Vec<_> = std::fs::read_dir(config.commitlog_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    segments.sort();
    let newest = segments
        .iter()
        .rev()
        .find(|p| std::fs::metadata(p).unwrap().len() > 0)
        .unwrap();
    let mut file = std::fs::OpenOptions::new().append(true).open(newest).unwrap();
    file.write_all(&[0x52, 0x4B, 0x43, 0x31, 0xFF, 0x00]).unwrap();
    drop(file);

    let engine = open(&config);
    assert!(engine.read(&ReadCommand::partition("a")).unwrap().is_some());
    assert!(engine.read(&ReadCommand::partition("b")).unwrap().is_some());
    engine.write(Partition::upsert("c", "", [("v", "3")], 3)).unwrap();
}

#[test]
fn test_corrupt_sstable_quarantined_on_open() {
    let dir = TempDir::new().unwrap();
    let config = Config::for_node("n1", dir.path());
    {
        let engine = open(&config);
        engine.write(Partition::upsert("lost", "", [("v", "1")], 1)).unwrap();
        engine.flush().unwrap();
        engine.write(Partition::upsert("kept", "", [("v", "2")], 2)).unwrap();
        engine.flush().unwrap();
    }

    // damage the footer of the first table
    let mut tables: Vec<_> = std::fs::read_dir(config.sstable_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "db"))
        .collect();
    tables.sort();
    let mut bytes = std::fs::read(&tables[0]).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&tables[0], bytes).unwrap();

    let metrics = Arc::new(NodeMetrics::new());
    let engine = StorageEngine::open(&config, metrics.clone()).unwrap();
    assert_eq!(metrics.sstables_quarantined.get(), 1);
    assert_eq!(engine.stats().sstables.len(), 1);
    assert_eq!(std::fs::read_dir(config.quarantine_dir()).unwrap().count(), 1);
    assert!(engine.read(&ReadCommand::partition("kept")).unwrap().is_some());
}
