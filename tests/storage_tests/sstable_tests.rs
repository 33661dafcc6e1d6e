//! Tests for SSTable implementation
//!
//! These tests verify:
//! - Table creation and the returned file metadata
//! - Point lookups by internal key via the in-memory index
//! - Deletion and expiry statistics
//! - Iteration and seeking
//! - Checksum verification and format validation
//! - The table cache

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stratakv::comparator::BytewiseComparator;
use stratakv::env::{Env, PosixEnv};
use stratakv::expiry::{ExpiryModuleOs, ExpiryPolicy};
use stratakv::filename::{make_level_directories, table_file_name};
use stratakv::iterator::InternalIterator;
use stratakv::key::{InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType};
use stratakv::storage::{SSTableBuilder, SSTableReader, TableCache, TableInfo};
use stratakv::StrataError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_sstable() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.sst");
    (temp_dir, path)
}

fn env() -> Arc<dyn Env> {
    Arc::new(PosixEnv)
}

fn icmp() -> InternalKeyComparator {
    InternalKeyComparator::new(Arc::new(BytewiseComparator))
}

fn value_key(user_key: &[u8], seq: u64) -> InternalKey {
    InternalKey::new(user_key, 0, seq, ValueType::Value)
}

/// Create a table with numbered entries, one version each
fn create_sstable_with_entries(path: &Path, count: usize) -> TableInfo {
    let mut builder = SSTableBuilder::new(env(), path, None).unwrap();
    // Keys must be added in sorted order
    for i in 0..count {
        let key = format!("key{:05}", i);
        let value = format!("value{}", i);
        builder
            .add(value_key(key.as_bytes(), i as u64 + 1).encode(), value.as_bytes())
            .unwrap();
    }
    builder.finish().unwrap()
}

fn open_reader(path: &Path) -> Arc<SSTableReader> {
    Arc::new(SSTableReader::open(&PosixEnv, path, icmp()).unwrap())
}

/// Value stored under the newest version of `user_key`, if any
fn lookup(reader: &SSTableReader, user_key: &[u8]) -> Option<(ValueType, Vec<u8>)> {
    let target = LookupKey::new(user_key, 1 << 40);
    let (key, value) = reader.get(target.internal_key()).unwrap()?;
    let parsed = ParsedInternalKey::parse(&key).unwrap();
    (parsed.user_key == user_key).then(|| (parsed.value_type, value))
}

// =============================================================================
// SSTableBuilder Tests
// =============================================================================

#[test]
fn test_builder_creates_file() {
    let (_temp, path) = setup_temp_sstable();

    let info = create_sstable_with_entries(&path, 5);

    assert!(path.exists());
    assert_eq!(info.entry_count, 5);
    assert_eq!(info.file_size, fs::metadata(&path).unwrap().len());
}

#[test]
fn test_builder_tracks_smallest_and_largest() {
    let (_temp, path) = setup_temp_sstable();

    let info = create_sstable_with_entries(&path, 10);

    assert_eq!(info.smallest.user_key(), b"key00000");
    assert_eq!(info.largest.user_key(), b"key00009");
}

#[test]
fn test_builder_counts_deletions() {
    let (_temp, path) = setup_temp_sstable();

    let mut builder = SSTableBuilder::new(env(), &path, None).unwrap();
    builder.add(value_key(b"a", 3).encode(), b"1").unwrap();
    builder
        .add(InternalKey::new(b"b", 0, 2, ValueType::Deletion).encode(), b"")
        .unwrap();
    builder
        .add(InternalKey::new(b"c", 0, 1, ValueType::Deletion).encode(), b"")
        .unwrap();
    let info = builder.finish().unwrap();

    assert_eq!(info.counters.delete_count, 2);
    assert_eq!(open_reader(&path).delete_count(), 2);
}

#[test]
fn test_builder_counts_expired_keys_as_deletions() {
    let (_temp, path) = setup_temp_sstable();
    let policy: Arc<dyn ExpiryPolicy> = Arc::new(ExpiryModuleOs::new(0));

    let mut builder = SSTableBuilder::new(env(), &path, Some(policy)).unwrap();
    builder
        .add(InternalKey::new(b"a", 1, 2, ValueType::ValueExplicitExpiry).encode(), b"old")
        .unwrap();
    builder
        .add(InternalKey::new(b"b", u64::MAX, 1, ValueType::ValueExplicitExpiry).encode(), b"new")
        .unwrap();
    let info = builder.finish().unwrap();

    assert_eq!(info.counters.delete_count, 1);
    assert_eq!(info.counters.exp_explicit_high, u64::MAX);
}

#[test]
fn test_builder_abandon_removes_file() {
    let (_temp, path) = setup_temp_sstable();

    let mut builder = SSTableBuilder::new(env(), &path, None).unwrap();
    builder.add(value_key(b"a", 1).encode(), b"1").unwrap();
    assert_eq!(builder.num_entries(), 1);
    builder.abandon().unwrap();

    assert!(!path.exists());
}

// =============================================================================
// SSTableReader Tests
// =============================================================================

#[test]
fn test_reader_opens_valid_sstable() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 10);

    let reader = open_reader(&path);

    assert_eq!(reader.entry_count(), 10);
    assert_eq!(reader.delete_count(), 0);
}

#[test]
fn test_reader_get_existing_key() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 10);
    let reader = open_reader(&path);

    assert_eq!(lookup(&reader, b"key00005"), Some((ValueType::Value, b"value5".to_vec())));
}

#[test]
fn test_reader_get_nonexistent_key() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 10);
    let reader = open_reader(&path);

    assert_eq!(lookup(&reader, b"key00004x"), None);
    assert_eq!(lookup(&reader, b"zzz"), None);
}

#[test]
fn test_reader_get_respects_sequence() {
    let (_temp, path) = setup_temp_sstable();

    let mut builder = SSTableBuilder::new(env(), &path, None).unwrap();
    builder.add(value_key(b"k", 20).encode(), b"new").unwrap();
    builder.add(value_key(b"k", 10).encode(), b"old").unwrap();
    builder.finish().unwrap();
    let reader = open_reader(&path);

    let (_, value) = reader.get(LookupKey::new(b"k", 15).internal_key()).unwrap().unwrap();
    assert_eq!(value, b"old");
    let (_, value) = reader.get(LookupKey::new(b"k", 25).internal_key()).unwrap().unwrap();
    assert_eq!(value, b"new");
}

#[test]
fn test_reader_get_deletion() {
    let (_temp, path) = setup_temp_sstable();

    let mut builder = SSTableBuilder::new(env(), &path, None).unwrap();
    builder
        .add(InternalKey::new(b"k", 0, 2, ValueType::Deletion).encode(), b"")
        .unwrap();
    builder.add(value_key(b"k", 1).encode(), b"v").unwrap();
    builder.finish().unwrap();
    let reader = open_reader(&path);

    assert_eq!(lookup(&reader, b"k"), Some((ValueType::Deletion, Vec::new())));
}

#[test]
fn test_reader_random_access() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 100);
    let reader = open_reader(&path);

    for i in [99, 0, 50, 17, 73, 1] {
        let key = format!("key{:05}", i);
        let expected = format!("value{}", i).into_bytes();
        assert_eq!(lookup(&reader, key.as_bytes()), Some((ValueType::Value, expected)));
    }
}

#[test]
fn test_reader_approximate_offset_grows() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 100);
    let reader = open_reader(&path);

    let start = reader.approximate_offset_of(value_key(b"key00000", 1).encode());
    let middle = reader.approximate_offset_of(value_key(b"key00050", 51).encode());
    let end = reader.approximate_offset_of(value_key(b"zzz", 1).encode());

    assert!(start < middle);
    assert!(middle < end);
}

// =============================================================================
// Iterator Tests
// =============================================================================

#[test]
fn test_iterator_empty_sstable() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 0);

    let mut iter = open_reader(&path).iter();
    iter.seek_to_first().unwrap();

    assert!(!iter.is_valid());
}

#[test]
fn test_iterator_returns_all_entries() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 20);

    let mut iter = open_reader(&path).iter();
    iter.seek_to_first().unwrap();
    let mut count = 0;
    while iter.is_valid() {
        let parsed = ParsedInternalKey::parse(iter.key()).unwrap();
        assert_eq!(parsed.user_key, format!("key{:05}", count).as_bytes());
        assert_eq!(iter.value(), format!("value{}", count).as_bytes());
        count += 1;
        iter.next().unwrap();
    }

    assert_eq!(count, 20);
}

#[test]
fn test_iterator_seek() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 20);

    let mut iter = open_reader(&path).iter();
    iter.seek(InternalKey::seek_start(b"key00010x").encode()).unwrap();

    assert!(iter.is_valid());
    assert_eq!(ParsedInternalKey::parse(iter.key()).unwrap().user_key, b"key00011");

    iter.seek(InternalKey::seek_start(b"zzz").encode()).unwrap();
    assert!(!iter.is_valid());
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_verify_checksum_detects_flipped_byte() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 10);
    open_reader(&path).verify_checksum().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[20] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let err = open_reader(&path).verify_checksum().unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_open_nonexistent_file() {
    let temp = TempDir::new().unwrap();

    let result = SSTableReader::open(&PosixEnv, &temp.path().join("missing.sst"), icmp());

    assert!(matches!(result, Err(StrataError::Io(_))));
}

#[test]
fn test_open_invalid_magic() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 3);

    let mut bytes = fs::read(&path).unwrap();
    bytes[0..4].copy_from_slice(b"NOPE");
    fs::write(&path, bytes).unwrap();

    let err = SSTableReader::open(&PosixEnv, &path, icmp()).err().unwrap();
    assert!(err.is_corruption());
}

#[test]
fn test_open_truncated_file() {
    let (_temp, path) = setup_temp_sstable();
    fs::write(&path, b"STKV").unwrap();

    let err = SSTableReader::open(&PosixEnv, &path, icmp()).err().unwrap();
    assert!(err.is_corruption());
}

// =============================================================================
// TableCache Tests
// =============================================================================

#[test]
fn test_table_cache_reuses_and_evicts_readers() {
    let temp = TempDir::new().unwrap();
    let db = temp.path();
    make_level_directories(&PosixEnv, db).unwrap();
    create_sstable_with_entries(&table_file_name(db, 7, 2), 5);

    let cache = TableCache::new(db, env(), icmp());
    assert!(cache.is_empty());

    let first = cache.get(7, 2).unwrap();
    let second = cache.get(7, 2).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);

    let found = cache
        .find(7, 2, LookupKey::new(b"key00003", 1 << 40).internal_key())
        .unwrap()
        .unwrap();
    assert_eq!(found.1, b"value3");

    cache.evict(7);
    assert!(cache.is_empty());
}

#[test]
fn test_table_cache_missing_file() {
    let temp = TempDir::new().unwrap();
    let cache = TableCache::new(temp.path(), env(), icmp());

    assert!(cache.get(1, 0).is_err());
    assert_eq!(cache.delete_count(1, 0), 0);
}
