//! MemTable implementation
//!
//! Skip-list memtable ordered by the internal key comparator.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::expiry::ExpiryPolicy;
use crate::iterator::InternalIterator;
use crate::key::{
    append_internal_key, ExpiryTime, InternalKeyComparator, LookupKey, ParsedInternalKey, SequenceNumber,
    ValueType,
};

/// Bookkeeping bytes charged per entry on top of key and value
const ENTRY_OVERHEAD: usize = 32;

/// Internal key that orders itself with the table's comparator
#[derive(Clone)]
struct MemKey {
    key: Vec<u8>,
    icmp: InternalKeyComparator,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.icmp.compare(&self.key, &other.key)
    }
}

/// Outcome of a memtable point lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemGet {
    Found(Vec<u8>),
    /// Newest visible record is a deletion or has expired
    Deleted,
    /// No record for the key; older data must be consulted
    NotFound,
}

/// In-memory table for recent writes
pub struct MemTable {
    icmp: InternalKeyComparator,
    table: SkipMap<MemKey, Vec<u8>>,
    memory_usage: AtomicUsize,
}

impl MemTable {
    pub fn new(icmp: InternalKeyComparator) -> Self {
        Self {
            icmp,
            table: SkipMap::new(),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Insert one versioned record
    pub fn add(&self, seq: SequenceNumber, value_type: ValueType, user_key: &[u8], value: &[u8], expiry: ExpiryTime) {
        let mut key = Vec::with_capacity(user_key.len() + 16);
        append_internal_key(&mut key, &ParsedInternalKey::new(user_key, expiry, seq, value_type));

        let charge = key.len() + value.len() + ENTRY_OVERHEAD;
        self.table.insert(
            MemKey {
                key,
                icmp: self.icmp.clone(),
            },
            value.to_vec(),
        );
        self.memory_usage.fetch_add(charge, AtomicOrdering::Relaxed);
    }

    /// Newest record for the key with sequence <= the lookup's sequence
    pub fn get(&self, lookup: &LookupKey, expiry: Option<&dyn ExpiryPolicy>) -> MemGet {
        let target = MemKey {
            key: lookup.internal_key().to_vec(),
            icmp: self.icmp.clone(),
        };
        let entry = match self.table.lower_bound(Bound::Included(&target)) {
            Some(entry) => entry,
            None => return MemGet::NotFound,
        };

        let parsed = match ParsedInternalKey::parse(&entry.key().key) {
            Some(p) => p,
            None => return MemGet::NotFound,
        };
        if self.icmp.compare_user(parsed.user_key, lookup.user_key()) != Ordering::Equal {
            return MemGet::NotFound;
        }

        match parsed.value_type {
            ValueType::Deletion => MemGet::Deleted,
            ValueType::Value => MemGet::Found(entry.value().clone()),
            ValueType::ValueWriteTime | ValueType::ValueExplicitExpiry => {
                let expired = expiry.map_or(false, |p| p.expiry_activated() && p.key_retirement_callback(&parsed));
                if expired {
                    MemGet::Deleted
                } else {
                    MemGet::Found(entry.value().clone())
                }
            }
        }
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(AtomicOrdering::Relaxed)
    }

    pub fn num_entries(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Iterator that keeps this table alive
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: Arc::clone(self),
            current: None,
        }
    }
}

// =============================================================================
// MemTableIterator
// =============================================================================

/// Owning iterator over a memtable
///
/// Each step copies the entry it lands on and re-seeks from it, so the
/// iterator never borrows from the skip list.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemTableIterator {
    fn land(&mut self, bound: Bound<&MemKey>) {
        self.current = self
            .mem
            .table
            .lower_bound(bound)
            .map(|e| (e.key().key.clone(), e.value().clone()));
    }
}

impl InternalIterator for MemTableIterator {
    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.current = self
            .mem
            .table
            .front()
            .map(|e| (e.key().key.clone(), e.value().clone()));
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let target = MemKey {
            key: target.to_vec(),
            icmp: self.mem.icmp.clone(),
        };
        self.land(Bound::Included(&target));
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            let from = MemKey {
                key,
                icmp: self.mem.icmp.clone(),
            };
            self.land(Bound::Excluded(&from));
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(k, _)| k.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(_, v)| v.as_slice())
    }
}
