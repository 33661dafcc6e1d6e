//! Log Reader
//!
//! Reassembles logical records from a log file, skipping damaged fragments.

use std::ops::Range;

use crate::coding::decode_fixed32;

use super::{record_crc, unmask_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Receives notice of bytes dropped because of corruption
pub trait Reporter {
    fn corruption(&mut self, bytes: usize, reason: &str);
}

/// Reporter that discards every notice
impl Reporter for () {
    fn corruption(&mut self, _bytes: usize, _reason: &str) {}
}

enum Fragment {
    /// Payload range inside the file image
    Record(RecordType, Range<usize>),
    Eof,
    /// Damaged fragment; the rest of its block was skipped
    Bad,
}

/// Reads records from an in-memory copy of a log file
pub struct LogReader<'r> {
    data: Vec<u8>,
    /// Start of the block being parsed
    block_start: usize,
    /// Read position inside the current block
    pos: usize,
    reporter: &'r mut dyn Reporter,
    verify_checksums: bool,
}

impl<'r> LogReader<'r> {
    pub fn new(data: Vec<u8>, reporter: &'r mut dyn Reporter, verify_checksums: bool) -> Self {
        Self {
            data,
            block_start: 0,
            pos: 0,
            reporter,
            verify_checksums,
        }
    }

    /// Next complete logical record, `None` at end of file
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            let fragment = self.read_physical_record();
            let payload = match &fragment {
                Fragment::Record(_, range) => &self.data[range.clone()],
                _ => &[][..],
            };
            match fragment {
                Fragment::Record(RecordType::Full, _) => {
                    if in_fragmented_record && !scratch.is_empty() {
                        let dropped = scratch.len();
                        self.reporter.corruption(dropped, "partial record without end(1)");
                    }
                    return Some(payload.to_vec());
                }
                Fragment::Record(RecordType::First, _) => {
                    if in_fragmented_record && !scratch.is_empty() {
                        let dropped = scratch.len();
                        self.reporter.corruption(dropped, "partial record without end(2)");
                    }
                    scratch.clear();
                    scratch.extend_from_slice(payload);
                    in_fragmented_record = true;
                }
                Fragment::Record(RecordType::Middle, _) => {
                    if in_fragmented_record {
                        scratch.extend_from_slice(payload);
                    } else {
                        let dropped = payload.len();
                        self.reporter.corruption(dropped, "missing start of fragmented record(1)");
                    }
                }
                Fragment::Record(RecordType::Last, _) => {
                    if in_fragmented_record {
                        scratch.extend_from_slice(payload);
                        return Some(scratch);
                    }
                    let dropped = payload.len();
                    self.reporter.corruption(dropped, "missing start of fragmented record(2)");
                }
                Fragment::Record(RecordType::Zero, _) => {}
                Fragment::Eof => {
                    // A writer that died mid-record leaves a truncated tail;
                    // that is not reported as corruption.
                    return None;
                }
                Fragment::Bad => {
                    if in_fragmented_record {
                        let dropped = scratch.len();
                        self.reporter.corruption(dropped, "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Fragment {
        loop {
            let block_end = (self.block_start + BLOCK_SIZE).min(self.data.len());
            if self.block_start + self.pos + HEADER_SIZE > block_end {
                if block_end == self.data.len() {
                    return Fragment::Eof;
                }
                // Trailer padding; move to the next block.
                self.block_start += BLOCK_SIZE;
                self.pos = 0;
                continue;
            }

            let at = self.block_start + self.pos;
            let mut header = [0u8; HEADER_SIZE];
            header.copy_from_slice(&self.data[at..at + HEADER_SIZE]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let type_byte = header[6];

            if at + HEADER_SIZE + length > block_end {
                let dropped = block_end - at;
                self.skip_block();
                if block_end == self.data.len() {
                    return Fragment::Eof;
                }
                self.reporter.corruption(dropped, "bad record length");
                return Fragment::Bad;
            }

            if type_byte == RecordType::Zero as u8 && length == 0 {
                // Zero-filled space; nothing more in this block.
                self.skip_block();
                continue;
            }

            let record_type = match RecordType::from_u8(type_byte) {
                Some(t) => t,
                None => {
                    let dropped = HEADER_SIZE + length;
                    self.pos += dropped;
                    self.reporter.corruption(dropped, "unknown record type");
                    return Fragment::Bad;
                }
            };

            let payload_start = at + HEADER_SIZE;
            let payload_end = payload_start + length;

            if self.verify_checksums {
                let expected = unmask_crc(decode_fixed32(&header));
                let actual = record_crc(record_type, &self.data[payload_start..payload_end]);
                if expected != actual {
                    let dropped = block_end - at;
                    self.skip_block();
                    self.reporter.corruption(dropped, "checksum mismatch");
                    return Fragment::Bad;
                }
            }

            self.pos += HEADER_SIZE + length;
            return Fragment::Record(record_type, payload_start..payload_end);
        }
    }

    fn skip_block(&mut self) {
        self.block_start += BLOCK_SIZE;
        self.pos = 0;
    }
}
