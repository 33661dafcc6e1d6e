//! Log Record Framing
//!
//! Shared by the write-ahead log segments and the manifest.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────── block (32 KiB) ─────────────────────────┐
//! │ ┌─────────┬─────────┬──────────┬─────────┐ ┌─────────┬──────┐           │
//! │ │ CRC (4) │ Len (2) │ Type (1) │ Payload │ │ Header  │ ...  │ (padding) │
//! │ └─────────┴─────────┴──────────┴─────────┘ └─────────┴──────┘           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A logical record that does not fit in the remainder of a block is split
//! into First/Middle/Last fragments. A block tail shorter than a header is
//! zero-filled. The CRC covers the type byte and the payload and is masked.

mod reader;
mod writer;

pub use reader::{LogReader, Reporter};
pub use writer::LogWriter;

// =============================================================================
// Shared Constants
// =============================================================================

pub const BLOCK_SIZE: usize = 32 * 1024;

/// CRC (4) + Length (2) + Type (1)
pub const HEADER_SIZE: usize = 4 + 2 + 1;

/// Fragment kind stored in the header's type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Preallocated or padded space
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    pub(crate) fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

const MASK_DELTA: u32 = 0xa282_ead8;

/// CRC of the type byte followed by the payload
pub(crate) fn record_crc(record_type: RecordType, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[record_type as u8]);
    hasher.update(payload);
    hasher.finalize()
}

/// Masked form stored on disk; a CRC of data containing CRCs is weak otherwise
pub(crate) fn mask_crc(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

pub(crate) fn unmask_crc(masked: u32) -> u32 {
    masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}
