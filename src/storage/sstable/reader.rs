//! SSTable Reader
//!
//! Opens table files and serves O(log n) lookups via an in-memory index.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use crate::coding::{decode_fixed32, decode_fixed64};
use crate::env::{Env, RandomAccessFile};
use crate::error::{Result, StrataError};
use crate::key::InternalKeyComparator;

use super::iterator::SSTableIterator;
use super::{ENTRY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Reader for SSTable files with an in-memory index
pub struct SSTableReader {
    file: Box<dyn RandomAccessFile>,
    icmp: InternalKeyComparator,
    /// Index: internal key → file offset, in file order
    index: Vec<(Vec<u8>, u64)>,
    entry_count: u64,
    delete_count: u64,
    /// Index block starting offset (end of the data section)
    index_offset: u64,
    data_crc: u32,
}

impl SSTableReader {
    /// Open an SSTable for reading
    ///
    /// Loads the entire index into memory.
    pub fn open(env: &dyn Env, path: &Path, icmp: InternalKeyComparator) -> Result<Self> {
        let file = env.new_random_access_file(path)?;
        let file_size = file.size();

        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(StrataError::corruption(format!(
                "{}: file too short to be a table",
                path.display()
            )));
        }

        let header = file.read_at(0, HEADER_SIZE as usize)?;
        if &header[0..4] != MAGIC {
            return Err(StrataError::corruption(format!(
                "{}: bad table magic {:?}",
                path.display(),
                &header[0..4]
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(StrataError::corruption(format!(
                "{}: unsupported table version {}",
                path.display(),
                version
            )));
        }

        let footer = file.read_at(file_size - FOOTER_SIZE, FOOTER_SIZE as usize)?;
        let entry_count = decode_fixed64(&footer[0..8]);
        let index_offset = decode_fixed64(&footer[8..16]);
        let delete_count = decode_fixed64(&footer[16..24]);
        let data_crc = decode_fixed32(&footer[24..28]);

        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(StrataError::corruption(format!(
                "{}: bad index offset {}",
                path.display(),
                index_offset
            )));
        }

        let index_block_size = file_size - FOOTER_SIZE - index_offset;
        let index_data = file.read_at(index_offset, index_block_size as usize)?;

        // Parse index entries: [key_len(4)][offset(8)][key]
        let mut index = Vec::with_capacity(entry_count as usize);
        let mut pos = 0;
        while pos < index_data.len() {
            if pos + 12 > index_data.len() {
                return Err(StrataError::corruption("truncated table index"));
            }
            let key_len = decode_fixed32(&index_data[pos..]) as usize;
            let offset = decode_fixed64(&index_data[pos + 4..]);
            pos += 12;
            if pos + key_len > index_data.len() {
                return Err(StrataError::corruption("truncated table index key"));
            }
            index.push((index_data[pos..pos + key_len].to_vec(), offset));
            pos += key_len;
        }

        if index.len() as u64 != entry_count {
            return Err(StrataError::corruption(format!(
                "{}: index holds {} entries, footer says {}",
                path.display(),
                index.len(),
                entry_count
            )));
        }

        Ok(Self {
            file,
            icmp,
            index,
            entry_count,
            delete_count,
            index_offset,
            data_crc,
        })
    }

    /// First entry whose key is >= `target`, as (internal key, value)
    pub fn get(&self, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let pos = self.seek_position(target);
        if pos >= self.index.len() {
            return Ok(None);
        }
        self.read_entry(pos).map(Some)
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Tombstones and already-expired keys recorded when the file was built
    pub fn delete_count(&self) -> u64 {
        self.delete_count
    }

    /// Smallest internal key in this table
    pub fn smallest(&self) -> Option<&[u8]> {
        self.index.first().map(|(k, _)| k.as_slice())
    }

    /// Largest internal key in this table
    pub fn largest(&self) -> Option<&[u8]> {
        self.index.last().map(|(k, _)| k.as_slice())
    }

    /// File offset where data for `key` begins (or would begin)
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let pos = self.seek_position(key);
        self.index.get(pos).map_or(self.index_offset, |(_, off)| *off)
    }

    /// Re-read the data section and compare it to the stored checksum
    pub fn verify_checksum(&self) -> Result<()> {
        let data = self.file.read_at(HEADER_SIZE, (self.index_offset - HEADER_SIZE) as usize)?;
        let actual = crc32fast::hash(&data);
        if actual != self.data_crc {
            return Err(StrataError::corruption(format!(
                "table checksum mismatch: expected {:08x}, got {:08x}",
                self.data_crc, actual
            )));
        }
        Ok(())
    }

    /// Create an iterator over all entries
    pub fn iter(self: &Arc<Self>) -> SSTableIterator {
        SSTableIterator::new(Arc::clone(self))
    }

    // =========================================================================
    // Crate Helpers (used by the iterator)
    // =========================================================================

    pub(super) fn len(&self) -> usize {
        self.index.len()
    }

    /// Index position of the first key >= `target`
    pub(super) fn seek_position(&self, target: &[u8]) -> usize {
        self.index
            .partition_point(|(k, _)| self.icmp.compare(k, target) == Ordering::Less)
    }

    /// Read the entry at index position `pos`
    pub(super) fn read_entry(&self, pos: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        let start = self.index[pos].1;
        let end = self.index.get(pos + 1).map_or(self.index_offset, |(_, off)| *off);
        if end < start + ENTRY_HEADER_SIZE as u64 {
            return Err(StrataError::corruption("table entry overlaps its successor"));
        }

        let raw = self.file.read_at(start, (end - start) as usize)?;
        let key_len = decode_fixed32(&raw[0..4]) as usize;
        let val_len = decode_fixed32(&raw[4..8]) as usize;
        if ENTRY_HEADER_SIZE + key_len + val_len != raw.len() {
            return Err(StrataError::corruption("table entry length mismatch"));
        }

        let key = raw[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + key_len].to_vec();
        if self.icmp.compare(&key, &self.index[pos].0) != Ordering::Equal {
            return Err(StrataError::corruption("table entry disagrees with index"));
        }
        let value = raw[ENTRY_HEADER_SIZE + key_len..].to_vec();
        Ok((key, value))
    }
}
