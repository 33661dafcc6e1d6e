//! Internal key codec
//!
//! Every record stored by the engine is addressed by an internal key:
//!
//! ```text
//! ┌───────────────┬──────────────────────────┬───────────────────────────┐
//! │ user key      │ expiry (8, optional)     │ (sequence << 8) | type (8)│
//! └───────────────┴──────────────────────────┴───────────────────────────┘
//! ```
//!
//! The expiry field is present only for `ValueWriteTime` and
//! `ValueExplicitExpiry`. Internal keys order by user key ascending, then by
//! sequence number descending, so the newest version of a key sorts first.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::coding::{decode_fixed64, put_fixed64, put_varint32, varint_length};
use crate::comparator::Comparator;
use crate::expiry::ExpiryPolicy;
use crate::version::Compaction;

/// Monotonic commit counter; 56 bits are usable
pub type SequenceNumber = u64;

/// Microseconds since the epoch, 0 meaning "no expiry"
pub type ExpiryTime = u64;

pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1u64 << 56) - 1;

/// Record kind packed into the low byte of the trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
    ValueWriteTime = 2,
    ValueExplicitExpiry = 3,
}

/// Type used when building seek targets; sorts before every other type at
/// the same sequence number
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            2 => Some(ValueType::ValueWriteTime),
            3 => Some(ValueType::ValueExplicitExpiry),
            _ => None,
        }
    }

    pub fn has_expiry(self) -> bool {
        matches!(self, ValueType::ValueWriteTime | ValueType::ValueExplicitExpiry)
    }
}

pub fn pack_sequence_and_type(seq: SequenceNumber, t: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

/// Size of the trailer for a key of this type
pub fn key_suffix_size(t: ValueType) -> usize {
    if t.has_expiry() {
        16
    } else {
        8
    }
}

pub fn append_internal_key(dst: &mut Vec<u8>, key: &ParsedInternalKey<'_>) {
    dst.extend_from_slice(key.user_key);
    if key.value_type.has_expiry() {
        put_fixed64(dst, key.expiry);
    }
    put_fixed64(dst, pack_sequence_and_type(key.sequence, key.value_type));
}

/// Value type of an encoded internal key
pub fn extract_value_type(internal_key: &[u8]) -> Option<ValueType> {
    if internal_key.len() < 8 {
        return None;
    }
    ValueType::from_u8(internal_key[internal_key.len() - 8])
}

/// Strips the trailer (and expiry, when present) from an internal key
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    match extract_value_type(internal_key) {
        Some(t) if internal_key.len() >= key_suffix_size(t) => {
            &internal_key[..internal_key.len() - key_suffix_size(t)]
        }
        _ => &internal_key[..internal_key.len().saturating_sub(8)],
    }
}

pub fn extract_sequence_number(internal_key: &[u8]) -> SequenceNumber {
    decode_fixed64(&internal_key[internal_key.len() - 8..]) >> 8
}

/// Expiry field of an internal key, 0 when the type carries none
pub fn extract_expiry(internal_key: &[u8]) -> ExpiryTime {
    match extract_value_type(internal_key) {
        Some(t) if t.has_expiry() && internal_key.len() >= 16 => {
            decode_fixed64(&internal_key[internal_key.len() - 16..])
        }
        _ => 0,
    }
}

// =============================================================================
// ParsedInternalKey
// =============================================================================

/// Borrowed, decoded view of an internal key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub expiry: ExpiryTime,
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn new(user_key: &'a [u8], expiry: ExpiryTime, sequence: SequenceNumber, value_type: ValueType) -> Self {
        Self {
            user_key,
            expiry,
            sequence,
            value_type,
        }
    }

    /// Decode an internal key; `None` when the trailer is malformed
    pub fn parse(internal_key: &'a [u8]) -> Option<Self> {
        let n = internal_key.len();
        if n < 8 {
            return None;
        }
        let num = decode_fixed64(&internal_key[n - 8..]);
        let value_type = ValueType::from_u8((num & 0xff) as u8)?;
        let suffix = key_suffix_size(value_type);
        if n < suffix {
            return None;
        }
        let expiry = if value_type.has_expiry() {
            decode_fixed64(&internal_key[n - 16..n - 8])
        } else {
            0
        };
        Some(Self {
            user_key: &internal_key[..n - suffix],
            expiry,
            sequence: num >> 8,
            value_type,
        })
    }

    pub fn encoding_length(&self) -> usize {
        self.user_key.len() + key_suffix_size(self.value_type)
    }
}

impl fmt::Debug for ParsedInternalKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' @ {} : {}",
            String::from_utf8_lossy(self.user_key),
            self.sequence,
            self.value_type as u8
        )?;
        if self.value_type.has_expiry() {
            write!(f, " exp {}", self.expiry)?;
        }
        Ok(())
    }
}

// =============================================================================
// InternalKey
// =============================================================================

/// Owned, encoded internal key
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], expiry: ExpiryTime, sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + 16);
        append_internal_key(&mut rep, &ParsedInternalKey::new(user_key, expiry, sequence, value_type));
        Self { rep }
    }

    /// Earliest internal key for `user_key`: sorts before every stored version
    pub fn seek_start(user_key: &[u8]) -> Self {
        Self::new(user_key, 0, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)
    }

    /// Latest internal key for `user_key`: sorts after every stored version
    pub fn seek_limit(user_key: &[u8]) -> Self {
        Self::new(user_key, 0, 0, ValueType::Deletion)
    }

    pub fn decode_from(encoded: &[u8]) -> Self {
        Self { rep: encoded.to_vec() }
    }

    pub fn encode(&self) -> &[u8] {
        &self.rep
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    pub fn parsed(&self) -> Option<ParsedInternalKey<'_>> {
        ParsedInternalKey::parse(&self.rep)
    }

    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }

    pub fn clear(&mut self) {
        self.rep.clear();
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parsed() {
            Some(p) => write!(f, "{:?}", p),
            None => write!(f, "(bad){}", String::from_utf8_lossy(&self.rep)),
        }
    }
}

// =============================================================================
// InternalKeyComparator
// =============================================================================

/// Orders encoded internal keys: user key ascending, sequence descending
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternalKeyComparator({})", self.user.name())
    }
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn name(&self) -> &str {
        "leveldb.InternalKeyComparator"
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let anum = normalized_trailer(a);
                let bnum = normalized_trailer(b);
                bnum.cmp(&anum)
            }
            other => other,
        }
    }

    pub fn compare_keys(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.encode(), b.encode())
    }

    pub fn compare_user(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }
}

// Expiry types order exactly like plain values.
fn normalized_trailer(internal_key: &[u8]) -> u64 {
    if internal_key.len() < 8 {
        return 0;
    }
    let num = decode_fixed64(&internal_key[internal_key.len() - 8..]);
    match ValueType::from_u8((num & 0xff) as u8) {
        Some(t) if t.has_expiry() => (num & !0xff) | ValueType::Value as u64,
        _ => num,
    }
}

// =============================================================================
// LookupKey
// =============================================================================

/// Point-lookup key for the memtable and the tables
///
/// ```text
/// varint32(len(user_key) + 8) | user_key | fixed64(seq << 8 | seek type)
/// ```
#[derive(Clone)]
pub struct LookupKey {
    data: Vec<u8>,
    kstart: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let internal_len = user_key.len() + 8;
        let mut data = Vec::with_capacity(varint_length(internal_len as u64) + internal_len);
        put_varint32(&mut data, internal_len as u32);
        let kstart = data.len();
        data.extend_from_slice(user_key);
        put_fixed64(&mut data, pack_sequence_and_type(sequence, VALUE_TYPE_FOR_SEEK));
        Self { data, kstart }
    }

    /// Length-prefixed form used by the memtable
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.kstart..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[self.kstart..self.data.len() - 8]
    }

    pub fn sequence(&self) -> SequenceNumber {
        extract_sequence_number(self.internal_key())
    }
}

// =============================================================================
// KeyRetirement
// =============================================================================

/// Decides, key by key in internal-key order, which records a flush or
/// compaction may drop
///
/// A record is dropped when a newer record for the same user key is already
/// visible to the oldest snapshot, or when it is a tombstone (or expired)
/// that no snapshot can see and no deeper level can hold an older copy of.
pub struct KeyRetirement {
    user_comparator: Arc<dyn Comparator>,
    smallest_snapshot: SequenceNumber,
    expiry: Option<Arc<dyn ExpiryPolicy>>,
    current_user_key: Option<Vec<u8>>,
    last_sequence_for_key: SequenceNumber,
    /// Tombstones dropped
    pub dropped: u64,
    /// Expired keys dropped
    pub expired: u64,
}

impl KeyRetirement {
    pub fn new(
        user_comparator: Arc<dyn Comparator>,
        smallest_snapshot: SequenceNumber,
        expiry: Option<Arc<dyn ExpiryPolicy>>,
    ) -> Self {
        Self {
            user_comparator,
            smallest_snapshot,
            expiry: expiry.filter(|e| e.expiry_activated()),
            current_user_key: None,
            last_sequence_for_key: MAX_SEQUENCE_NUMBER,
            dropped: 0,
            expired: 0,
        }
    }

    /// True when `internal_key` should not be written to the output.
    /// Without a compaction (memtable flush) tombstones are always kept.
    pub fn retire(&mut self, internal_key: &[u8], compaction: Option<&mut Compaction>) -> bool {
        let Some(ikey) = ParsedInternalKey::parse(internal_key) else {
            // Keep malformed keys visible.
            self.current_user_key = None;
            self.last_sequence_for_key = MAX_SEQUENCE_NUMBER;
            return false;
        };

        let same_key = self
            .current_user_key
            .as_deref()
            .map_or(false, |k| self.user_comparator.compare(ikey.user_key, k) == Ordering::Equal);
        if !same_key {
            self.current_user_key = Some(ikey.user_key.to_vec());
            self.last_sequence_for_key = MAX_SEQUENCE_NUMBER;
        }

        let mut drop = false;
        if self.last_sequence_for_key <= self.smallest_snapshot {
            // Hidden by a newer entry for the same user key
            drop = true;
        } else {
            let expired = self.expiry.as_ref().map_or(false, |e| e.key_retirement_callback(&ikey));
            if (ikey.value_type == ValueType::Deletion || expired)
                && ikey.sequence <= self.smallest_snapshot
                && compaction.map_or(false, |c| c.is_base_level_for_key(ikey.user_key))
            {
                drop = true;
                if expired {
                    self.expired += 1;
                } else {
                    self.dropped += 1;
                }
            }
        }

        self.last_sequence_for_key = ikey.sequence;
        drop
    }
}
