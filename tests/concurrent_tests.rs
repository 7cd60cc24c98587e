// Concurrency tests for mergeset
// These tests run ingestion, searches, merges and snapshots at the same time

use mergeset::{Error, Options, Table};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn test_options() -> Options {
    Options::new()
        .flush_interval(Duration::from_millis(20))
        .final_merge_delay(Duration::from_millis(200))
        .merge_workers(4)
}

fn all_items(table: &Table) -> Vec<Vec<u8>> {
    let mut ts = table.search();
    ts.seek(b"").unwrap();
    let mut items = Vec::new();
    while ts.next_item().unwrap() {
        items.push(ts.item().to_vec());
    }
    items
}

#[test]
fn test_concurrent_add_items() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let table = Arc::new(Table::open(dir.path(), test_options().max_pending_blocks(4)).unwrap());

    let mut handles = vec![];
    for thread_id in 0..8 {
        let table = Arc::clone(&table);
        handles.push(thread::spawn(move || {
            for batch in 0..50 {
                let items: Vec<String> =
                    (0..100).map(|i| format!("t{}:b{:03}:i{:03}", thread_id, batch, i)).collect();
                table.add_items(&items).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    table.debug_flush().unwrap();
    let items = all_items(&table);
    assert_eq!(items.len(), 8 * 50 * 100);
    assert!(items.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(table.metrics().items_added, 8 * 50 * 100);
}

#[test]
fn test_searches_during_merges() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let table = Arc::new(Table::open(dir.path(), test_options()).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut round = 0;
            while !stop.load(Ordering::Relaxed) {
                let items: Vec<String> = (0..200).map(|i| format!("w{:05}:{:03}", round, i)).collect();
                table.add_items(&items).unwrap();
                table.debug_flush().unwrap();
                round += 1;
            }
            round
        })
    };

    let mut readers = vec![];
    for _ in 0..4 {
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let items = all_items(&table);
                // Flushed rounds are always complete and sorted.
                assert_eq!(items.len() % 200, 0);
                assert!(items.windows(2).all(|w| w[0] < w[1]));
            }
        }));
    }

    thread::sleep(Duration::from_secs(2));
    stop.store(true, Ordering::Relaxed);
    let rounds = writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(all_items(&table).len(), rounds * 200);
}

#[test]
fn test_snapshot_during_merges() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let snapshots = TempDir::new().unwrap();
    let table = Arc::new(Table::open(dir.path().join("table"), test_options()).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut round = 0;
            while !stop.load(Ordering::Relaxed) {
                let items: Vec<String> = (0..100).map(|i| format!("bg{:05}:{:03}", round, i)).collect();
                table.add_items(&items).unwrap();
                round += 1;
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    for n in 0..5 {
        let known: Vec<String> = (0..500).map(|i| format!("snap{}:{:04}", n, i)).collect();
        table.add_items(&known).unwrap();

        let snapshot_path = snapshots.path().join(format!("s{}", n));
        table.create_snapshot_at(&snapshot_path).unwrap();

        let snapshot = Table::open(&snapshot_path, Options::new().merge_workers(1)).unwrap();
        let items: BTreeSet<Vec<u8>> = all_items(&snapshot).into_iter().collect();
        for item in &known {
            assert!(items.contains(item.as_bytes()), "snapshot {} lacks {}", n, item);
        }
        snapshot.close().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}

#[test]
fn test_snapshot_errors() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let table = Table::open(dir.path().join("table"), test_options()).unwrap();
    table.add_items(&["a"]).unwrap();

    let dst = dir.path().join("snap");
    table.create_snapshot_at(&dst).unwrap();
    assert!(matches!(table.create_snapshot_at(&dst), Err(Error::AlreadyExists(_))));
    assert!(matches!(
        table.create_snapshot_at(dir.path().join("table").join("inner")),
        Err(Error::InvalidArgument(_))
    ));
}
