//! Tests for Version
//!
//! These tests verify:
//! - Edits install files in key order per level
//! - Point lookups across overlapped and sorted levels
//! - Overlap queries used by compaction selection
//! - Level verification and the debug listing
//! - Old versions stay readable while pinned

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use stratakv::filename::table_file_name;
use stratakv::key::{InternalKey, InternalKeyComparator, LookupKey, ValueType, MAX_SEQUENCE_NUMBER};
use stratakv::storage::{SSTableBuilder, TableCache};
use stratakv::version::{FileMetaData, VersionEdit, VersionSet};
use stratakv::{Engine, Options};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

struct Fixture {
    _temp: TempDir,
    db: PathBuf,
    options: Arc<Options>,
    table_cache: Arc<TableCache>,
    vset: Mutex<VersionSet>,
}

/// Fresh database directory with a recovered version set over it
fn setup_temp_version_set() -> Fixture {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("db");
    Engine::open(Options::builder().create_if_missing(true).build(), &db)
        .unwrap()
        .close()
        .unwrap();

    let options = Arc::new(Options::builder().build());
    let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
    let table_cache = Arc::new(TableCache::new(&db, Arc::clone(&options.env), icmp.clone()));
    let mut vset = VersionSet::new(&db, Arc::clone(&options), Arc::clone(&table_cache), icmp);
    vset.recover().unwrap();

    Fixture {
        _temp: temp,
        db,
        options,
        table_cache,
        vset: Mutex::new(vset),
    }
}

/// Write a table holding `records` (user key, sequence, type, value) and
/// describe it for `level`
fn build_table(fx: &Fixture, level: usize, records: &[(&str, u64, ValueType, &str)]) -> FileMetaData {
    let number = fx.vset.lock().new_file_number();
    let path = table_file_name(&fx.db, number, level);
    let mut builder = SSTableBuilder::new(Arc::clone(&fx.options.env), &path, None).unwrap();
    for (key, seq, value_type, value) in records {
        let ikey = InternalKey::new(key.as_bytes(), 0, *seq, *value_type);
        builder.add(ikey.encode(), value.as_bytes()).unwrap();
    }
    let info = builder.finish().unwrap();
    FileMetaData::new(number, level, info.file_size, info.smallest, info.largest)
}

fn apply(fx: &Fixture, edit: &mut VersionEdit) {
    let mut guard = fx.vset.lock();
    VersionSet::log_and_apply(&mut guard, edit).unwrap();
}

fn add_files(fx: &Fixture, files: Vec<(usize, FileMetaData)>) {
    let mut edit = VersionEdit::new();
    for (level, f) in files {
        edit.add_file(level, f);
    }
    apply(fx, &mut edit);
}

fn get(fx: &Fixture, key: &str) -> Option<String> {
    let version = fx.vset.lock().current();
    version
        .get(&LookupKey::new(key.as_bytes(), MAX_SEQUENCE_NUMBER), &fx.table_cache, None)
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}

fn file_numbers(fx: &Fixture, level: usize) -> Vec<u64> {
    fx.vset.lock().current().files(level).iter().map(|f| f.number).collect()
}

// =============================================================================
// Installation Tests
// =============================================================================

#[test]
fn test_sorted_level_ordered_by_smallest_key() {
    let fx = setup_temp_version_set();
    let late = build_table(&fx, 3, &[("x", 1, ValueType::Value, "1"), ("z", 2, ValueType::Value, "2")]);
    let early = build_table(&fx, 3, &[("a", 3, ValueType::Value, "3"), ("c", 4, ValueType::Value, "4")]);
    let (late_number, early_number) = (late.number, early.number);

    add_files(&fx, vec![(3, late), (3, early)]);

    assert_eq!(file_numbers(&fx, 3), vec![early_number, late_number]);
    assert_eq!(fx.vset.lock().num_level_files(3), 2);
}

#[test]
fn test_delete_file_removes_it_from_level() {
    let fx = setup_temp_version_set();
    let f = build_table(&fx, 2, &[("k", 1, ValueType::Value, "v")]);
    let number = f.number;
    add_files(&fx, vec![(2, f)]);

    let mut edit = VersionEdit::new();
    edit.delete_file(2, number);
    apply(&fx, &mut edit);

    assert!(file_numbers(&fx, 2).is_empty());
    assert_eq!(get(&fx, "k"), None);
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[test]
fn test_get_from_sorted_level() {
    let fx = setup_temp_version_set();
    let left = build_table(&fx, 3, &[("a", 1, ValueType::Value, "va"), ("c", 2, ValueType::Value, "vc")]);
    let right = build_table(&fx, 3, &[("m", 3, ValueType::Value, "vm"), ("p", 4, ValueType::Value, "vp")]);
    add_files(&fx, vec![(3, left), (3, right)]);

    assert_eq!(get(&fx, "a").as_deref(), Some("va"));
    assert_eq!(get(&fx, "p").as_deref(), Some("vp"));
    assert_eq!(get(&fx, "b"), None);
    assert_eq!(get(&fx, "n"), None);
    assert_eq!(get(&fx, "zzz"), None);
}

#[test]
fn test_get_prefers_newest_overlapped_file() {
    let fx = setup_temp_version_set();
    let older = build_table(&fx, 0, &[("a", 1, ValueType::Value, "old"), ("k", 2, ValueType::Value, "old")]);
    let newer = build_table(&fx, 0, &[("k", 5, ValueType::Value, "new"), ("z", 6, ValueType::Value, "new")]);
    add_files(&fx, vec![(0, older), (0, newer)]);

    assert_eq!(get(&fx, "k").as_deref(), Some("new"));
    assert_eq!(get(&fx, "a").as_deref(), Some("old"));
}

#[test]
fn test_get_stops_at_shallower_deletion() {
    let fx = setup_temp_version_set();
    let deep = build_table(&fx, 4, &[("k", 1, ValueType::Value, "v")]);
    let tombstone = build_table(&fx, 1, &[("k", 9, ValueType::Deletion, "")]);
    add_files(&fx, vec![(4, deep), (1, tombstone)]);

    assert_eq!(get(&fx, "k"), None);
}

#[test]
fn test_get_respects_lookup_sequence() {
    let fx = setup_temp_version_set();
    let f = build_table(&fx, 2, &[("k", 20, ValueType::Value, "new"), ("k", 10, ValueType::Value, "old")]);
    add_files(&fx, vec![(2, f)]);

    let version = fx.vset.lock().current();
    let at = |seq| {
        version
            .get(&LookupKey::new(b"k", seq), &fx.table_cache, None)
            .unwrap()
    };

    assert_eq!(at(5), None);
    assert_eq!(at(15), Some(b"old".to_vec()));
    assert_eq!(at(25), Some(b"new".to_vec()));
}

// =============================================================================
// Overlap Tests
// =============================================================================

#[test]
fn test_overlapping_inputs_in_sorted_level() {
    let fx = setup_temp_version_set();
    let a = build_table(&fx, 3, &[("a", 1, ValueType::Value, ""), ("c", 1, ValueType::Value, "")]);
    let b = build_table(&fx, 3, &[("e", 1, ValueType::Value, ""), ("g", 1, ValueType::Value, "")]);
    let c = build_table(&fx, 3, &[("k", 1, ValueType::Value, ""), ("m", 1, ValueType::Value, "")]);
    let numbers = [a.number, b.number, c.number];
    add_files(&fx, vec![(3, a), (3, b), (3, c)]);

    let version = fx.vset.lock().current();
    let inputs = |begin: &str, end: &str| -> Vec<u64> {
        version
            .get_overlapping_inputs(
                3,
                Some(&InternalKey::seek_start(begin.as_bytes())),
                Some(&InternalKey::seek_limit(end.as_bytes())),
            )
            .iter()
            .map(|f| f.number)
            .collect()
    };

    assert_eq!(inputs("b", "f"), vec![numbers[0], numbers[1]]);
    assert_eq!(inputs("h", "j"), Vec::<u64>::new());
    assert_eq!(inputs("m", "z"), vec![numbers[2]]);
    assert_eq!(version.get_overlapping_inputs(3, None, None).len(), 3);
}

#[test]
fn test_overlap_in_level_unbounded_ranges() {
    let fx = setup_temp_version_set();
    let f = build_table(&fx, 5, &[("d", 1, ValueType::Value, ""), ("f", 1, ValueType::Value, "")]);
    add_files(&fx, vec![(5, f)]);

    let version = fx.vset.lock().current();
    assert!(version.overlap_in_level(5, None, None));
    assert!(version.overlap_in_level(5, None, Some(b"d")));
    assert!(version.overlap_in_level(5, Some(b"f"), None));
    assert!(!version.overlap_in_level(5, Some(b"g"), None));
    assert!(!version.overlap_in_level(5, None, Some(b"c")));
    assert!(!version.overlap_in_level(6, None, None));
}

// =============================================================================
// Verification / Debug Tests
// =============================================================================

#[test]
fn test_verify_levels_finds_overlap_in_sorted_level() {
    let fx = setup_temp_version_set();
    let a = build_table(&fx, 2, &[("a", 1, ValueType::Value, ""), ("h", 1, ValueType::Value, "")]);
    let b = build_table(&fx, 2, &[("c", 2, ValueType::Value, ""), ("d", 2, ValueType::Value, "")]);
    add_files(&fx, vec![(2, a), (2, b)]);

    let version = fx.vset.lock().current();
    let (level, begin, end) = version.verify_levels(0).unwrap();

    assert_eq!(level, 2);
    assert_eq!(begin.user_key(), b"a");
    assert_eq!(end.user_key(), b"h");
}

#[test]
fn test_verify_levels_ignores_overlapped_levels() {
    let fx = setup_temp_version_set();
    let a = build_table(&fx, 0, &[("a", 1, ValueType::Value, ""), ("h", 1, ValueType::Value, "")]);
    let b = build_table(&fx, 0, &[("c", 2, ValueType::Value, ""), ("d", 2, ValueType::Value, "")]);
    add_files(&fx, vec![(0, a), (0, b)]);

    assert!(fx.vset.lock().current().verify_levels(0).is_none());
}

#[test]
fn test_debug_string_lists_files() {
    let fx = setup_temp_version_set();
    let f = build_table(&fx, 4, &[("apple", 3, ValueType::Value, "x")]);
    let number = f.number;
    add_files(&fx, vec![(4, f)]);

    let listing = fx.vset.lock().current().debug_string();

    assert!(listing.contains("--- level 4 ---"));
    assert!(listing.contains(&format!(" {}:", number)));
    assert!(listing.contains("'apple' @ 3 : 1"));
}

// =============================================================================
// Pinning Tests
// =============================================================================

#[test]
fn test_pinned_version_keeps_old_files() {
    let fx = setup_temp_version_set();
    let f = build_table(&fx, 3, &[("k", 1, ValueType::Value, "v")]);
    let number = f.number;
    add_files(&fx, vec![(3, f)]);

    let pinned = fx.vset.lock().current();
    let mut edit = VersionEdit::new();
    edit.delete_file(3, number);
    apply(&fx, &mut edit);

    assert_eq!(pinned.num_files(3), 1);
    assert!(fx.vset.lock().live_files().contains(&number));
    assert_eq!(
        pinned
            .get(&LookupKey::new(b"k", MAX_SEQUENCE_NUMBER), &fx.table_cache, None)
            .unwrap(),
        Some(b"v".to_vec())
    );

    drop(pinned);
    assert!(!fx.vset.lock().live_files().contains(&number));
}
