//! MemTable Tests
//!
//! Tests verify:
//! - Versioned inserts and point lookups
//! - Snapshot visibility by sequence number
//! - Deletion markers
//! - Expiry-aware lookups
//! - Memory accounting
//! - Sorted iteration over internal keys
//! - Concurrent access patterns

use std::sync::Arc;
use std::thread;

use stratakv::comparator::BytewiseComparator;
use stratakv::expiry::{ExpiryModuleOs, ExpiryPolicy};
use stratakv::iterator::InternalIterator;
use stratakv::key::{InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType, MAX_SEQUENCE_NUMBER};
use stratakv::memtable::{MemGet, MemTable};

// =============================================================================
// Helper Functions
// =============================================================================

fn new_memtable() -> Arc<MemTable> {
    Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator))))
}

fn lookup(mem: &MemTable, key: &[u8]) -> MemGet {
    mem.get(&LookupKey::new(key, MAX_SEQUENCE_NUMBER), None)
}

fn collect(mem: &Arc<MemTable>) -> Vec<(Vec<u8>, u64, ValueType)> {
    let mut iter = mem.iter();
    iter.seek_to_first().unwrap();
    let mut out = Vec::new();
    while iter.is_valid() {
        let parsed = ParsedInternalKey::parse(iter.key()).unwrap();
        out.push((parsed.user_key.to_vec(), parsed.sequence, parsed.value_type));
        iter.next().unwrap();
    }
    out
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_new_memtable_is_empty() {
    let mem = new_memtable();
    assert_eq!(mem.num_entries(), 0);
    assert_eq!(mem.approximate_memory_usage(), 0);
    assert!(mem.is_empty());
}

#[test]
fn test_add_and_get() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"key1", b"value1", 0);

    assert_eq!(lookup(&mem, b"key1"), MemGet::Found(b"value1".to_vec()));
}

#[test]
fn test_get_nonexistent_key() {
    let mem = new_memtable();
    mem.add(1, ValueType::Value, b"key1", b"value1", 0);

    assert_eq!(lookup(&mem, b"key0"), MemGet::NotFound);
    assert_eq!(lookup(&mem, b"key2"), MemGet::NotFound);
}

#[test]
fn test_newer_version_wins() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"key1", b"value1", 0);
    mem.add(2, ValueType::Value, b"key1", b"value2", 0);

    // Both versions are kept side by side
    assert_eq!(mem.num_entries(), 2);
    assert_eq!(lookup(&mem, b"key1"), MemGet::Found(b"value2".to_vec()));
}

#[test]
fn test_lookup_respects_sequence() {
    let mem = new_memtable();

    mem.add(10, ValueType::Value, b"key", b"old", 0);
    mem.add(20, ValueType::Value, b"key", b"new", 0);

    assert_eq!(mem.get(&LookupKey::new(b"key", 9), None), MemGet::NotFound);
    assert_eq!(mem.get(&LookupKey::new(b"key", 10), None), MemGet::Found(b"old".to_vec()));
    assert_eq!(mem.get(&LookupKey::new(b"key", 19), None), MemGet::Found(b"old".to_vec()));
    assert_eq!(mem.get(&LookupKey::new(b"key", 20), None), MemGet::Found(b"new".to_vec()));
}

#[test]
fn test_user_key_prefix_is_not_a_match() {
    let mem = new_memtable();
    mem.add(1, ValueType::Value, b"abc", b"v", 0);

    assert_eq!(lookup(&mem, b"ab"), MemGet::NotFound);
}

// =============================================================================
// Deletion Tests
// =============================================================================

#[test]
fn test_deletion_hides_value() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"key1", b"value1", 0);
    mem.add(2, ValueType::Deletion, b"key1", b"", 0);

    assert_eq!(lookup(&mem, b"key1"), MemGet::Deleted);
    assert_eq!(mem.num_entries(), 2);
}

#[test]
fn test_deletion_invisible_to_older_snapshot() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"key1", b"value1", 0);
    mem.add(2, ValueType::Deletion, b"key1", b"", 0);

    assert_eq!(mem.get(&LookupKey::new(b"key1", 1), None), MemGet::Found(b"value1".to_vec()));
}

#[test]
fn test_put_after_delete() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"key1", b"value1", 0);
    mem.add(2, ValueType::Deletion, b"key1", b"", 0);
    mem.add(3, ValueType::Value, b"key1", b"value2", 0);

    assert_eq!(lookup(&mem, b"key1"), MemGet::Found(b"value2".to_vec()));
}

// =============================================================================
// Expiry Tests
// =============================================================================

#[test]
fn test_explicit_expiry_in_the_past_reads_as_deleted() {
    let mem = new_memtable();
    let policy = ExpiryModuleOs::new(0);

    mem.add(1, ValueType::ValueExplicitExpiry, b"gone", b"v", 1);
    mem.add(2, ValueType::ValueExplicitExpiry, b"kept", b"v", u64::MAX);

    let expiry: Option<&dyn ExpiryPolicy> = Some(&policy);
    assert_eq!(mem.get(&LookupKey::new(b"gone", MAX_SEQUENCE_NUMBER), expiry), MemGet::Deleted);
    assert_eq!(
        mem.get(&LookupKey::new(b"kept", MAX_SEQUENCE_NUMBER), expiry),
        MemGet::Found(b"v".to_vec())
    );
}

#[test]
fn test_expiry_ignored_without_policy() {
    let mem = new_memtable();

    mem.add(1, ValueType::ValueExplicitExpiry, b"gone", b"v", 1);

    assert_eq!(lookup(&mem, b"gone"), MemGet::Found(b"v".to_vec()));
}

#[test]
fn test_disabled_policy_keeps_expired_keys() {
    let mem = new_memtable();
    let policy = ExpiryModuleOs::new(0).enabled(false);

    mem.add(1, ValueType::ValueExplicitExpiry, b"gone", b"v", 1);

    assert_eq!(
        mem.get(&LookupKey::new(b"gone", MAX_SEQUENCE_NUMBER), Some(&policy)),
        MemGet::Found(b"v".to_vec())
    );
}

// =============================================================================
// Memory Accounting Tests
// =============================================================================

#[test]
fn test_memory_usage_grows_with_inserts() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"key", b"value", 0);
    let after_one = mem.approximate_memory_usage();
    assert!(after_one >= b"key".len() + b"value".len() + 8);

    mem.add(2, ValueType::Value, b"key", b"value", 0);
    assert_eq!(mem.approximate_memory_usage(), after_one * 2);
}

#[test]
fn test_memory_usage_counts_large_values() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"big", &vec![0u8; 100_000], 0);

    assert!(mem.approximate_memory_usage() > 100_000);
}

// =============================================================================
// Iterator Tests
// =============================================================================

#[test]
fn test_iter_empty() {
    let mem = new_memtable();
    let mut iter = mem.iter();
    iter.seek_to_first().unwrap();
    assert!(!iter.is_valid());
}

#[test]
fn test_iter_sorted_by_user_key_then_newest_first() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"b", b"b1", 0);
    mem.add(2, ValueType::Value, b"a", b"a1", 0);
    mem.add(3, ValueType::Value, b"b", b"b2", 0);
    mem.add(4, ValueType::Deletion, b"c", b"", 0);

    assert_eq!(
        collect(&mem),
        vec![
            (b"a".to_vec(), 2, ValueType::Value),
            (b"b".to_vec(), 3, ValueType::Value),
            (b"b".to_vec(), 1, ValueType::Value),
            (b"c".to_vec(), 4, ValueType::Deletion),
        ]
    );
}

#[test]
fn test_iter_seek() {
    let mem = new_memtable();
    for (i, key) in [b"apple", b"grape", b"mango"].iter().enumerate() {
        mem.add(i as u64 + 1, ValueType::Value, *key, b"v", 0);
    }

    let mut iter = mem.iter();
    iter.seek(LookupKey::new(b"banana", MAX_SEQUENCE_NUMBER).internal_key()).unwrap();

    assert!(iter.is_valid());
    assert_eq!(ParsedInternalKey::parse(iter.key()).unwrap().user_key, b"grape");
    assert_eq!(iter.value(), b"v");
}

#[test]
fn test_iter_outlives_other_handles() {
    let mem = new_memtable();
    mem.add(1, ValueType::Value, b"key", b"value", 0);

    let mut iter = mem.iter();
    drop(mem);

    iter.seek_to_first().unwrap();
    assert!(iter.is_valid());
    assert_eq!(iter.value(), b"value");
}

#[test]
fn test_iter_sees_later_inserts_past_cursor() {
    let mem = new_memtable();
    mem.add(1, ValueType::Value, b"a", b"1", 0);

    let mut iter = mem.iter();
    iter.seek_to_first().unwrap();
    mem.add(2, ValueType::Value, b"b", b"2", 0);
    iter.next().unwrap();

    assert!(iter.is_valid());
    assert_eq!(iter.value(), b"2");
}

// =============================================================================
// Edge Cases
// =============================================================================

#[test]
fn test_empty_key_and_value() {
    let mem = new_memtable();

    mem.add(1, ValueType::Value, b"", b"", 0);

    assert_eq!(lookup(&mem, b""), MemGet::Found(Vec::new()));
}

#[test]
fn test_many_entries() {
    let mem = new_memtable();

    for i in 0..1000u64 {
        let key = format!("key{:05}", i);
        mem.add(i + 1, ValueType::Value, key.as_bytes(), format!("value{}", i).as_bytes(), 0);
    }

    assert_eq!(mem.num_entries(), 1000);
    assert_eq!(lookup(&mem, b"key00500"), MemGet::Found(b"value500".to_vec()));
    let keys: Vec<_> = collect(&mem).into_iter().map(|(k, _, _)| k).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_reads() {
    let mem = new_memtable();
    for i in 0..100u64 {
        mem.add(i + 1, ValueType::Value, format!("key{}", i).as_bytes(), b"value", 0);
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mem = Arc::clone(&mem);
            thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("key{}", i);
                    assert_eq!(lookup(&mem, key.as_bytes()), MemGet::Found(b"value".to_vec()));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_reads_during_single_writer() {
    let mem = new_memtable();

    let writer = {
        let mem = Arc::clone(&mem);
        thread::spawn(move || {
            for i in 0..500u64 {
                mem.add(i + 1, ValueType::Value, format!("key{:04}", i).as_bytes(), b"value", 0);
            }
        })
    };

    let reader = {
        let mem = Arc::clone(&mem);
        thread::spawn(move || {
            for i in 0..500 {
                let key = format!("key{:04}", i);
                match lookup(&mem, key.as_bytes()) {
                    MemGet::Found(v) => assert_eq!(v, b"value"),
                    MemGet::NotFound => {}
                    MemGet::Deleted => panic!("no deletions were written"),
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(mem.num_entries(), 500);
}
