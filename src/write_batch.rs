//! Write Batch
//!
//! An atomic group of updates, serialized exactly as it is logged:
//!
//! ```text
//! ┌──────────────┬───────────┬──────────────────────────────────────────┐
//! │ sequence (8) │ count (4) │ records...                               │
//! └──────────────┴───────────┴──────────────────────────────────────────┘
//!
//! record := Value(1)               varstring key, varstring value
//!         | Deletion(0)            varstring key
//!         | ValueWriteTime(2)      varstring key, fixed64 expiry, varstring value
//!         | ValueExplicitExpiry(3) varstring key, fixed64 expiry, varstring value
//! ```

use crate::coding::{
    decode_fixed32, decode_fixed64, get_fixed64, get_length_prefixed_slice, put_fixed64,
    put_length_prefixed_slice,
};
use crate::error::{Result, StrataError};
use crate::expiry::ExpiryPolicy;
use crate::key::{ExpiryTime, SequenceNumber, ValueType};
use crate::memtable::MemTable;

/// Sequence (8) + count (4)
pub(crate) const BATCH_HEADER: usize = 12;

/// Receives the records of a batch in order
pub trait BatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8], value_type: ValueType, expiry: ExpiryTime);

    fn delete(&mut self, key: &[u8]);
}

#[derive(Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatch")
            .field("sequence", &self.sequence())
            .field("count", &self.count())
            .field("bytes", &self.rep.len())
            .finish()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Store `value` until `expiry` (microseconds since the epoch)
    pub fn put_with_expiry(&mut self, key: &[u8], value: &[u8], expiry: ExpiryTime) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::ValueExplicitExpiry as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_fixed64(&mut self.rep, expiry);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER, 0);
    }

    /// Number of records
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..])
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Size of the serialized form
    pub fn byte_size(&self) -> usize {
        self.rep.len()
    }

    /// Append every record of `other`
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER..]);
    }

    /// Replay the records into `handler`
    pub fn iterate(&self, handler: &mut dyn BatchHandler) -> Result<()> {
        let mut input = &self.rep[BATCH_HEADER..];
        let mut found = 0u32;

        while let Some((&tag, rest)) = input.split_first() {
            input = rest;
            found += 1;
            match ValueType::from_u8(tag) {
                Some(ValueType::Value) => {
                    let key = get_length_prefixed_slice(&mut input);
                    let value = get_length_prefixed_slice(&mut input);
                    match (key, value) {
                        (Some(k), Some(v)) => handler.put(k, v, ValueType::Value, 0),
                        _ => return Err(StrataError::corruption("bad WriteBatch Put")),
                    }
                }
                Some(t @ (ValueType::ValueWriteTime | ValueType::ValueExplicitExpiry)) => {
                    let key = get_length_prefixed_slice(&mut input);
                    let expiry = get_fixed64(&mut input);
                    let value = get_length_prefixed_slice(&mut input);
                    match (key, expiry, value) {
                        (Some(k), Some(e), Some(v)) => handler.put(k, v, t, e),
                        _ => return Err(StrataError::corruption("bad WriteBatch Expiry")),
                    }
                }
                Some(ValueType::Deletion) => match get_length_prefixed_slice(&mut input) {
                    Some(k) => handler.delete(k),
                    None => return Err(StrataError::corruption("bad WriteBatch Delete")),
                },
                None => return Err(StrataError::corruption("unknown WriteBatch tag")),
            }
        }

        if found != self.count() {
            return Err(StrataError::corruption("WriteBatch has wrong count"));
        }
        Ok(())
    }

    /// Apply the batch to `mem` at consecutive sequence numbers
    pub(crate) fn insert_into(&self, mem: &MemTable, expiry: Option<&dyn ExpiryPolicy>) -> Result<()> {
        let mut inserter = MemTableInserter {
            sequence: self.sequence(),
            mem,
            expiry,
        };
        self.iterate(&mut inserter)
    }

    /// Sequence number of the first record; zero until the batch is logged
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep)
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// Serialized form, as written to the log
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Rebuild a batch from a log record
    pub fn from_contents(contents: &[u8]) -> Result<Self> {
        if contents.len() < BATCH_HEADER {
            return Err(StrataError::corruption("log record too small"));
        }
        Ok(Self {
            rep: contents.to_vec(),
        })
    }
}

// =============================================================================
// MemTableInserter
// =============================================================================

struct MemTableInserter<'a> {
    sequence: SequenceNumber,
    mem: &'a MemTable,
    expiry: Option<&'a dyn ExpiryPolicy>,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8], value_type: ValueType, expiry: ExpiryTime) {
        let mut value_type = value_type;
        let mut expiry = expiry;
        if let Some(policy) = self.expiry {
            policy.memtable_inserter_callback(key, value, &mut value_type, &mut expiry);
        }
        self.mem.add(self.sequence, value_type, key, value, expiry);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, &[], 0);
        self.sequence += 1;
    }
}
