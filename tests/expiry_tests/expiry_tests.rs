//! Tests for the expiry policy
//!
//! These tests verify:
//! - Which table files qualify for whole-file expiry
//! - Expired files are kept while deeper levels overlap them
//! - Engine reads hide aged-out and past-deadline values
//! - Expired files are removed without a merge

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stratakv::expiry::{ExpiryModuleOs, ExpiryPolicy};
use stratakv::key::{InternalKey, InternalKeyComparator, ValueType};
use stratakv::storage::TableCache;
use stratakv::throttle::CachedClock;
use stratakv::version::{FileMetaData, VersionEdit, VersionSet};
use stratakv::{Engine, Options, ReadOptions, WriteOptions};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const MINUTE: u64 = 60 * 1_000_000;
const START: u64 = 1_000 * MINUTE;

fn file_with(exp_write_low: u64, exp_write_high: u64, exp_explicit_high: u64) -> FileMetaData {
    let mut f = FileMetaData::new(
        7,
        3,
        1024,
        InternalKey::new(b"a", 0, 1, ValueType::Value),
        InternalKey::new(b"z", 0, 1, ValueType::Value),
    );
    f.exp_write_low = exp_write_low;
    f.exp_write_high = exp_write_high;
    f.exp_explicit_high = exp_explicit_high;
    f
}

fn stopped_clock(micros: u64) -> Arc<CachedClock> {
    let clock = Arc::new(CachedClock::new());
    clock.set_micros(micros);
    clock
}

fn open_with_policy(db: &Path, policy: ExpiryModuleOs) -> Engine {
    let options = Options::builder()
        .create_if_missing(true)
        .expiry(Arc::new(policy))
        .build();
    Engine::open(options, db).unwrap()
}

fn get(engine: &Engine, key: &[u8]) -> Option<Vec<u8>> {
    engine.get(&ReadOptions::default(), key).unwrap()
}

fn total_files(engine: &Engine) -> usize {
    (0..7).map(|level| engine.test_num_files_at_level(level)).sum()
}

/// Empty database with a recovered version set, for placing metadata by hand
fn setup_temp_version_set() -> (TempDir, Mutex<VersionSet>) {
    let temp = TempDir::new().unwrap();
    let db: PathBuf = temp.path().join("db");
    Engine::open(Options::builder().create_if_missing(true).build(), &db)
        .unwrap()
        .close()
        .unwrap();

    let options = Arc::new(Options::builder().build());
    let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
    let table_cache = Arc::new(TableCache::new(&db, Arc::clone(&options.env), icmp.clone()));
    let mut vset = VersionSet::new(&db, options, table_cache, icmp);
    vset.recover().unwrap();
    (temp, Mutex::new(vset))
}

fn meta(number: u64, level: usize, smallest: &[u8], largest: &[u8], write_time: u64) -> FileMetaData {
    let mut f = FileMetaData::new(
        number,
        level,
        1024,
        InternalKey::new(smallest, write_time, 1, ValueType::ValueWriteTime),
        InternalKey::new(largest, write_time, 1, ValueType::ValueWriteTime),
    );
    f.exp_write_low = write_time;
    f.exp_write_high = write_time;
    f
}

// =============================================================================
// Whole-file Qualification Tests
// =============================================================================

#[test]
fn test_aged_write_time_file_expires() {
    let policy = ExpiryModuleOs::new(10);
    let f = file_with(START, START + MINUTE, 0);

    assert!(!policy.is_file_expired(&f, START + 10 * MINUTE));
    assert!(policy.is_file_expired(&f, START + 11 * MINUTE));
}

#[test]
fn test_plain_value_blocks_file_expiry() {
    let policy = ExpiryModuleOs::new(10);
    let f = file_with(0, START, 0);

    assert!(!policy.is_file_expired(&f, START + 100 * MINUTE));
}

#[test]
fn test_tombstone_only_file_never_expires() {
    let policy = ExpiryModuleOs::new(10);
    let f = file_with(u64::MAX, 0, 0);

    assert!(!policy.is_file_expired(&f, u64::MAX));
}

#[test]
fn test_explicit_only_file_expires_at_latest_deadline() {
    let policy = ExpiryModuleOs::new(0);
    let f = file_with(u64::MAX, 0, START);

    assert!(!policy.is_file_expired(&f, START - 1));
    assert!(policy.is_file_expired(&f, START));
}

#[test]
fn test_settings_that_disable_file_expiry() {
    let f = file_with(START, START, 0);
    let later = START + 100 * MINUTE;

    assert!(!ExpiryModuleOs::new(10).unlimited(true).is_file_expired(&f, later));
    assert!(!ExpiryModuleOs::new(0).is_file_expired(&f, later));
    assert!(!ExpiryModuleOs::new(10).whole_file_expiry(false).is_file_expired(&f, later));
    assert!(!ExpiryModuleOs::new(10).enabled(false).is_file_expired(&f, later));
}

// =============================================================================
// Finalize Callback Tests
// =============================================================================

#[test]
fn test_finalize_callback_records_expired_files() {
    let (_temp, vset) = setup_temp_version_set();
    let (old, fresh) = {
        let mut vset = vset.lock();
        (vset.new_file_number(), vset.new_file_number())
    };

    let mut edit = VersionEdit::new();
    edit.add_file(3, meta(old, 3, b"a", b"c", START));
    edit.add_file(3, meta(fresh, 3, b"m", b"p", START + 50 * MINUTE));
    {
        let mut guard = vset.lock();
        VersionSet::log_and_apply(&mut guard, &mut edit).unwrap();
    }

    let policy = ExpiryModuleOs::new(10).with_clock(stopped_clock(START + 20 * MINUTE));
    let version = vset.lock().current();
    let mut deletions = VersionEdit::new();

    assert!(policy.compaction_finalize_callback(true, &version, 3, Some(&mut deletions)));
    assert!(deletions.deleted_files().contains(&(3, old)));
    assert!(!deletions.deleted_files().contains(&(3, fresh)));
    assert!(!policy.compaction_finalize_callback(false, &version, 4, None));
}

#[test]
fn test_finalize_callback_keeps_file_shadowing_deeper_data() {
    let (_temp, vset) = setup_temp_version_set();
    let (shallow, deep) = {
        let mut vset = vset.lock();
        (vset.new_file_number(), vset.new_file_number())
    };

    let mut edit = VersionEdit::new();
    edit.add_file(2, meta(shallow, 2, b"a", b"f", START));
    edit.add_file(5, meta(deep, 5, b"d", b"k", START + 500 * MINUTE));
    {
        let mut guard = vset.lock();
        VersionSet::log_and_apply(&mut guard, &mut edit).unwrap();
    }

    let policy = ExpiryModuleOs::new(10).with_clock(stopped_clock(START + 20 * MINUTE));
    let version = vset.lock().current();
    let mut deletions = VersionEdit::new();

    assert!(!policy.compaction_finalize_callback(true, &version, 2, Some(&mut deletions)));
    assert_eq!(deletions.deleted_file_count(), 0);
}

// =============================================================================
// Engine Tests
// =============================================================================

#[test]
fn test_write_time_values_age_out() {
    let temp = TempDir::new().unwrap();
    let clock = stopped_clock(START);
    let engine = open_with_policy(&temp.path().join("db"), ExpiryModuleOs::new(5).with_clock(Arc::clone(&clock)));

    engine.put(&WriteOptions::default(), b"k", b"v").unwrap();
    assert_eq!(get(&engine, b"k"), Some(b"v".to_vec()));

    clock.set_micros(START + 5 * MINUTE);
    assert_eq!(get(&engine, b"k"), None);

    // Same answer once the value sits in a table file
    engine.test_compact_memtable().unwrap();
    assert_eq!(get(&engine, b"k"), None);
}

#[test]
fn test_flushed_write_time_value_ages_out() {
    let temp = TempDir::new().unwrap();
    let clock = stopped_clock(START);
    let engine = open_with_policy(&temp.path().join("db"), ExpiryModuleOs::new(5).with_clock(Arc::clone(&clock)));

    engine.put(&WriteOptions::default(), b"k", b"v").unwrap();
    engine.test_compact_memtable().unwrap();
    assert_eq!(get(&engine, b"k"), Some(b"v".to_vec()));

    clock.set_micros(START + 5 * MINUTE);
    assert_eq!(get(&engine, b"k"), None);
}

#[test]
fn test_explicit_deadline_hides_value() {
    let temp = TempDir::new().unwrap();
    let clock = stopped_clock(START);
    let engine = open_with_policy(&temp.path().join("db"), ExpiryModuleOs::new(0).with_clock(Arc::clone(&clock)));

    engine
        .put_with_expiry(&WriteOptions::default(), b"session", b"token", START + 30)
        .unwrap();
    engine.put(&WriteOptions::default(), b"plain", b"kept").unwrap();

    clock.set_micros(START + 29);
    assert_eq!(get(&engine, b"session"), Some(b"token".to_vec()));

    clock.set_micros(START + 30);
    assert_eq!(get(&engine, b"session"), None);
    assert_eq!(get(&engine, b"plain"), Some(b"kept".to_vec()));

    let keys: Vec<Vec<u8>> = engine.iter(&ReadOptions::default()).unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"plain".to_vec()]);
}

#[test]
fn test_disabled_policy_keeps_values() {
    let temp = TempDir::new().unwrap();
    let clock = stopped_clock(START);
    let policy = ExpiryModuleOs::new(1).enabled(false).with_clock(Arc::clone(&clock));
    let engine = open_with_policy(&temp.path().join("db"), policy);

    engine.put(&WriteOptions::default(), b"k", b"v").unwrap();
    clock.set_micros(START + 100 * MINUTE);

    assert_eq!(get(&engine, b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_expired_file_is_deleted_without_merge() {
    let temp = TempDir::new().unwrap();
    let clock = stopped_clock(START);
    let engine = open_with_policy(&temp.path().join("db"), ExpiryModuleOs::new(1).with_clock(Arc::clone(&clock)));

    for i in 0..20 {
        let key = format!("key{:02}", i);
        engine.put(&WriteOptions::default(), key.as_bytes(), b"value").unwrap();
    }
    engine.test_compact_memtable().unwrap();
    assert_eq!(total_files(&engine), 1);

    clock.set_micros(START + 2 * MINUTE);
    engine.check_available_compactions();

    let deadline = Instant::now() + Duration::from_secs(10);
    while total_files(&engine) != 0 || engine.is_compaction_scheduled() {
        assert!(Instant::now() < deadline, "expired file was not removed");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(get(&engine, b"key05"), None);
}
