//! Tests for compaction behaviour seen through the Engine
//!
//! These tests verify:
//! - Merging overlapped levels keeps only the newest value per key
//! - Deletions survive while a deeper level may still hold the key
//! - Manual compaction over the whole key space
//! - Automatic level-0 compaction once the trigger is reached
//! - Memtable output placement

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use stratakv::{Engine, Options, ReadOptions, StrataError, WriteOptions};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

fn open_with(temp_dir: &Path, options: Options) -> Engine {
    Engine::open(options, temp_dir.join("db")).unwrap()
}

fn get(engine: &Engine, key: &[u8]) -> Option<Vec<u8>> {
    engine.get(&ReadOptions::default(), key).unwrap()
}

fn put(engine: &Engine, key: &[u8], value: &[u8]) {
    engine.put(&WriteOptions::default(), key, value).unwrap();
}

fn files_per_level(engine: &Engine) -> Vec<usize> {
    (0..7).map(|level| engine.test_num_files_at_level(level)).collect()
}

fn wait_for_compactions(engine: &Engine, done: impl Fn(&Engine) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !engine.is_compaction_scheduled() && done(engine) {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("compactions did not settle: {:?}", files_per_level(engine));
}

// =============================================================================
// Overlapped Level Tests
// =============================================================================

#[test]
fn test_overlapped_merge_newest_wins() {
    let temp = setup_temp_dir();
    let engine = open_with(
        temp.path(),
        Options::builder().create_if_missing(true).max_mem_compact_level(0).build(),
    );

    put(&engine, b"a", b"a1");
    put(&engine, b"c", b"c1");
    engine.test_compact_memtable().unwrap();

    put(&engine, b"b", b"b1");
    put(&engine, b"c", b"c2");
    engine.test_compact_memtable().unwrap();

    assert_eq!(engine.test_num_files_at_level(0), 2);

    engine.test_compact_range(0, None, None).unwrap();

    assert_eq!(engine.test_num_files_at_level(0), 0);
    assert_eq!(engine.test_num_files_at_level(1), 1);

    let entries: Vec<_> = engine.iter(&ReadOptions::default()).unwrap().collect();
    assert_eq!(
        entries,
        vec![
            (b"a".to_vec(), b"a1".to_vec()),
            (b"b".to_vec(), b"b1".to_vec()),
            (b"c".to_vec(), b"c2".to_vec()),
        ]
    );
}

#[test]
fn test_level0_trigger_schedules_compaction() {
    let temp = setup_temp_dir();
    let engine = open_with(
        temp.path(),
        Options::builder()
            .create_if_missing(true)
            .max_mem_compact_level(0)
            .l0_triggers(2, 2, 8, 12)
            .build(),
    );

    for round in 0..2 {
        for i in 0..50 {
            let key = format!("key{:04}", i);
            put(&engine, key.as_bytes(), format!("round{}", round).as_bytes());
        }
        engine.test_compact_memtable().unwrap();
    }

    wait_for_compactions(&engine, |e| e.test_num_files_at_level(0) == 0);

    assert_eq!(engine.test_num_files_at_level(1), 1);
    for i in 0..50 {
        let key = format!("key{:04}", i);
        assert_eq!(get(&engine, key.as_bytes()), Some(b"round1".to_vec()));
    }
}

// =============================================================================
// Deletion Retention Tests
// =============================================================================

#[test]
fn test_deletion_kept_while_deeper_level_holds_key() {
    let temp = setup_temp_dir();
    let engine = open_with(
        temp.path(),
        Options::builder().create_if_missing(true).max_mem_compact_level(2).build(),
    );

    put(&engine, b"k", b"old");
    engine.test_compact_memtable().unwrap();
    assert_eq!(engine.test_num_files_at_level(2), 1);

    engine.test_compact_range(2, None, None).unwrap();
    engine.test_compact_range(3, None, None).unwrap();
    assert_eq!(engine.test_num_files_at_level(4), 1);

    engine.delete(&WriteOptions::default(), b"k").unwrap();
    engine.test_compact_memtable().unwrap();
    assert_eq!(engine.test_num_files_at_level(2), 1);

    // Level 4 still holds "k", so the deletion must travel down with it
    engine.test_compact_range(2, None, None).unwrap();
    assert_eq!(engine.test_num_files_at_level(2), 0);
    assert_eq!(engine.test_num_files_at_level(3), 1);
    assert_eq!(get(&engine, b"k"), None);

    // Merged with the value it hides and nothing deeper: both disappear
    engine.test_compact_range(3, None, None).unwrap();
    assert_eq!(engine.test_num_files_at_level(3), 0);
    assert_eq!(engine.test_num_files_at_level(4), 0);
    assert_eq!(get(&engine, b"k"), None);
}

#[test]
fn test_snapshot_keeps_shadowed_value_through_compaction() {
    let temp = setup_temp_dir();
    let engine = open_with(
        temp.path(),
        Options::builder().create_if_missing(true).max_mem_compact_level(0).build(),
    );

    put(&engine, b"k", b"v1");
    let snapshot = engine.snapshot();
    put(&engine, b"k", b"v2");
    engine.compact_range(None, None).unwrap();

    let at_snapshot = ReadOptions {
        snapshot: Some(snapshot.clone()),
        ..ReadOptions::default()
    };
    assert_eq!(engine.get(&at_snapshot, b"k").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(get(&engine, b"k"), Some(b"v2".to_vec()));

    engine.release_snapshot(snapshot);
}

// =============================================================================
// Manual Compaction Tests
// =============================================================================

#[test]
fn test_compact_range_pushes_everything_down() {
    let temp = setup_temp_dir();
    let engine = open_with(
        temp.path(),
        Options::builder().create_if_missing(true).max_mem_compact_level(0).build(),
    );

    for batch in 0..3 {
        for i in 0..100 {
            let key = format!("key{:04}", i * 3 + batch);
            put(&engine, key.as_bytes(), key.as_bytes());
        }
        engine.test_compact_memtable().unwrap();
    }
    assert_eq!(engine.test_num_files_at_level(0), 3);

    engine.compact_range(None, None).unwrap();

    // The deepest level holding the range is the last one written
    assert_eq!(engine.test_num_files_at_level(0), 0);
    assert_eq!(engine.test_num_files_at_level(1), 1);
    engine.verify_levels().unwrap();

    engine.test_compact_range(1, None, None).unwrap();
    assert_eq!(engine.test_num_files_at_level(1), 0);
    assert!(engine.test_num_files_at_level(2) >= 1);
    engine.verify_levels().unwrap();

    for i in 0..300 {
        let key = format!("key{:04}", i);
        assert_eq!(get(&engine, key.as_bytes()), Some(key.into_bytes()));
    }
}

#[test]
fn test_compact_range_partial_range() {
    let temp = setup_temp_dir();
    let engine = open_with(
        temp.path(),
        Options::builder().create_if_missing(true).max_mem_compact_level(0).build(),
    );

    put(&engine, b"a", b"1");
    put(&engine, b"m", b"2");
    engine.test_compact_memtable().unwrap();
    put(&engine, b"x", b"3");
    engine.test_compact_memtable().unwrap();

    engine.compact_range(Some(b"a"), Some(b"n")).unwrap();

    assert_eq!(get(&engine, b"a"), Some(b"1".to_vec()));
    assert_eq!(get(&engine, b"m"), Some(b"2".to_vec()));
    assert_eq!(get(&engine, b"x"), Some(b"3".to_vec()));
    engine.verify_levels().unwrap();
}

#[test]
fn test_compact_range_rejects_last_level() {
    let temp = setup_temp_dir();
    let engine = open_with(temp.path(), Options::builder().create_if_missing(true).build());

    let err = engine.test_compact_range(6, None, None).unwrap_err();

    assert!(matches!(err, StrataError::InvalidArgument(_)));
}

// =============================================================================
// Memtable Placement Tests
// =============================================================================

#[test]
fn test_memtable_output_pushed_past_overlapped_levels() {
    let temp = setup_temp_dir();
    let engine = open_with(temp.path(), Options::builder().create_if_missing(true).build());

    put(&engine, b"k", b"v");
    engine.test_compact_memtable().unwrap();

    assert_eq!(files_per_level(&engine), vec![0, 0, 0, 1, 0, 0, 0]);
    assert_eq!(get(&engine, b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_memtable_output_stays_in_level0_when_it_overlaps() {
    let temp = setup_temp_dir();
    let engine = open_with(
        temp.path(),
        Options::builder().create_if_missing(true).max_mem_compact_level(0).build(),
    );

    put(&engine, b"k", b"v1");
    engine.test_compact_memtable().unwrap();
    put(&engine, b"k", b"v2");
    engine.test_compact_memtable().unwrap();

    assert_eq!(engine.test_num_files_at_level(0), 2);
    assert_eq!(get(&engine, b"k"), Some(b"v2".to_vec()));
}

#[test]
fn test_compacted_data_survives_reopen() {
    let temp = setup_temp_dir();
    {
        let engine = open_with(
            temp.path(),
            Options::builder().create_if_missing(true).max_mem_compact_level(0).build(),
        );
        for i in 0..200 {
            let key = format!("key{:04}", i);
            put(&engine, key.as_bytes(), b"value");
        }
        engine.compact_range(None, None).unwrap();
        engine.close().unwrap();
    }

    let engine = open_with(temp.path(), Options::builder().build());
    engine.verify_levels().unwrap();
    assert_eq!(engine.test_num_files_at_level(0), 0);
    for i in 0..200 {
        let key = format!("key{:04}", i);
        assert_eq!(get(&engine, key.as_bytes()), Some(b"value".to_vec()));
    }
}
