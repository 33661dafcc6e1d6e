//! Log Writer
//!
//! Appends framed records to a log file.

use crate::coding::put_fixed32;
use crate::env::WritableFile;
use crate::error::Result;

use super::{mask_crc, record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Appends records to a WAL segment or manifest
pub struct LogWriter {
    dest: Box<dyn WritableFile>,
    /// Offset inside the current block
    block_offset: usize,
}

impl LogWriter {
    /// Start writing at the beginning of an empty file
    pub fn new(dest: Box<dyn WritableFile>) -> Self {
        Self::with_offset(dest, 0)
    }

    /// Continue a file that already holds `existing_len` bytes
    pub fn with_offset(dest: Box<dyn WritableFile>, existing_len: u64) -> Self {
        Self {
            dest,
            block_offset: (existing_len % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Append one logical record, fragmenting it across blocks as needed
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mut remaining = payload;
        let mut begin = true;

        // An empty payload still emits one zero-length Full record.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    self.dest.append(&[0u8; HEADER_SIZE][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = remaining.len().min(avail);
            let end = fragment_len == remaining.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &remaining[..fragment_len])?;
            remaining = &remaining[fragment_len..];
            begin = false;

            if end {
                break;
            }
        }

        self.dest.flush()
    }

    /// fsync the underlying file
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    fn emit_physical_record(&mut self, record_type: RecordType, fragment: &[u8]) -> Result<()> {
        debug_assert!(fragment.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + fragment.len() <= BLOCK_SIZE);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        put_fixed32(&mut header, mask_crc(record_crc(record_type, fragment)));
        header.extend_from_slice(&(fragment.len() as u16).to_le_bytes());
        header.push(record_type as u8);

        self.dest.append(&header)?;
        self.dest.append(fragment)?;
        self.block_offset += HEADER_SIZE + fragment.len();
        Ok(())
    }
}
