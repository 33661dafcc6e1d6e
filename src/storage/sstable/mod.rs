//! SSTable Module
//!
//! Sorted String Table - immutable on-disk run of internal keys.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (6 bytes)                                        │
//! │   Magic: "STKV" (4) | Version: u16 (2)                  │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][InternalKey][Value]        │
//! │   ... repeated for each entry ...                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (variable)                                  │
//! │   [KeyLen: u32][Offset: u64][InternalKey]               │
//! │   ... repeated for each entry ...                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (32 bytes)                                       │
//! │   EntryCount: u64 | IndexOffset: u64 | DeleteCount: u64 │
//! │   DataCRC: u32 | Padding (4)                            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Deletions are ordinary entries; their type lives in the internal key.
//! The delete count includes keys that were already expired when written.

mod builder;
mod iterator;
mod reader;

pub use builder::SSTableBuilder;
pub use iterator::SSTableIterator;
pub use reader::SSTableReader;

use crate::key::InternalKey;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a StrataKV table file
pub(crate) const MAGIC: &[u8; 4] = b"STKV";

/// Current table format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2)
pub(crate) const HEADER_SIZE: u64 = 6;

/// Footer size: EntryCount (8) + IndexOffset (8) + DeleteCount (8) + DataCRC (4) + Padding (4)
pub(crate) const FOOTER_SIZE: u64 = 32;

/// KeyLen (4) + ValLen (4)
pub(crate) const ENTRY_HEADER_SIZE: usize = 8;

// =============================================================================
// Table Statistics
// =============================================================================

/// Per-file statistics gathered while a table is built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounters {
    /// Keys added so far
    pub keys: u64,
    /// Tombstones plus keys already expired when written
    pub delete_count: u64,
    /// Earliest write time among write-time stamped keys
    pub exp_write_low: u64,
    /// Latest write time among write-time stamped keys
    pub exp_write_high: u64,
    /// Latest explicit expiry
    pub exp_explicit_high: u64,
}

/// Result of a finished table
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub entry_count: u64,
    pub file_size: u64,
    /// Smallest internal key (empty for an empty table)
    pub smallest: InternalKey,
    /// Largest internal key (empty for an empty table)
    pub largest: InternalKey,
    pub counters: TableCounters,
}
