//! Version Edit
//!
//! A delta applied to one version to produce the next. Each edit is written
//! to the manifest as one log record.
//!
//! ## Record Format
//! A sequence of tagged fields, every tag a varint32:
//! ```text
//! 1  Comparator      length-prefixed name
//! 2  LogNumber       varint64
//! 3  NextFileNumber  varint64
//! 4  LastSequence    varint64
//! 5  CompactPointer  varint32 level, length-prefixed internal key
//! 6  DeletedFile     varint32 level, varint64 number
//! 7  NewFile         varint32 level, varint64 number, varint64 size,
//!                    length-prefixed smallest, length-prefixed largest
//! 9  PrevLogNumber   varint64
//! 11 NewFile2        NewFile followed by three varint64 expiry counters
//! ```

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::coding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice, put_varint32, put_varint64,
};
use crate::config::NUM_LEVELS;
use crate::error::{Result, StrataError};
use crate::key::{InternalKey, SequenceNumber};

use super::FileMetaData;

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;
const TAG_NEW_FILE2: u32 = 11;

/// Changes between two versions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    comparator: Option<String>,
    log_number: Option<u64>,
    prev_log_number: Option<u64>,
    next_file_number: Option<u64>,
    last_sequence: Option<SequenceNumber>,
    compact_pointers: Vec<(usize, InternalKey)>,
    deleted_files: BTreeSet<(usize, u64)>,
    new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    // =========================================================================
    // Setters
    // =========================================================================

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Record a new file at `level`; the file's own `level` field is overwritten
    pub fn add_file(&mut self, level: usize, mut file: FileMetaData) {
        file.level = level;
        self.new_files.push((level, file));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn comparator_name(&self) -> Option<&str> {
        self.comparator.as_deref()
    }

    pub fn log_number(&self) -> Option<u64> {
        self.log_number
    }

    pub fn prev_log_number(&self) -> Option<u64> {
        self.prev_log_number
    }

    pub fn next_file_number(&self) -> Option<u64> {
        self.next_file_number
    }

    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.last_sequence
    }

    pub fn compact_pointers(&self) -> &[(usize, InternalKey)] {
        &self.compact_pointers
    }

    pub fn deleted_files(&self) -> &BTreeSet<(usize, u64)> {
        &self.deleted_files
    }

    pub fn deleted_file_count(&self) -> usize {
        self.deleted_files.len()
    }

    pub fn new_files(&self) -> &[(usize, FileMetaData)] {
        &self.new_files
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Serialize into `dst`. With `with_expiry` new files carry their expiry
    /// counters (tag 11); otherwise the plain format (tag 7) is written.
    pub fn encode_to(&self, dst: &mut Vec<u8>, with_expiry: bool) {
        if let Some(name) = &self.comparator {
            put_varint32(dst, TAG_COMPARATOR);
            put_length_prefixed_slice(dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(dst, TAG_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(dst, TAG_PREV_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(dst, TAG_NEXT_FILE_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint32(dst, TAG_LAST_SEQUENCE);
            put_varint64(dst, n);
        }

        for (level, key) in &self.compact_pointers {
            put_varint32(dst, TAG_COMPACT_POINTER);
            put_varint32(dst, *level as u32);
            put_length_prefixed_slice(dst, key.encode());
        }

        for (level, number) in &self.deleted_files {
            put_varint32(dst, TAG_DELETED_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, *number);
        }

        for (level, f) in &self.new_files {
            put_varint32(dst, if with_expiry { TAG_NEW_FILE2 } else { TAG_NEW_FILE });
            put_varint32(dst, *level as u32);
            put_varint64(dst, f.number);
            put_varint64(dst, f.file_size);
            put_length_prefixed_slice(dst, f.smallest.encode());
            put_length_prefixed_slice(dst, f.largest.encode());
            if with_expiry {
                put_varint64(dst, f.exp_write_low);
                put_varint64(dst, f.exp_write_high);
                put_varint64(dst, f.exp_explicit_high);
            }
        }
    }

    pub fn decode_from(src: &[u8]) -> Result<Self> {
        let mut edit = Self::new();
        let mut input = src;

        while !input.is_empty() {
            let tag = get_varint32(&mut input).ok_or_else(|| bad_field("tag"))?;
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed_slice(&mut input).ok_or_else(|| bad_field("comparator name"))?;
                    edit.comparator = Some(String::from_utf8_lossy(name).into_owned());
                }
                TAG_LOG_NUMBER => {
                    edit.log_number = Some(get_varint64(&mut input).ok_or_else(|| bad_field("log number"))?);
                }
                TAG_PREV_LOG_NUMBER => {
                    edit.prev_log_number =
                        Some(get_varint64(&mut input).ok_or_else(|| bad_field("previous log number"))?);
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number =
                        Some(get_varint64(&mut input).ok_or_else(|| bad_field("next file number"))?);
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(get_varint64(&mut input).ok_or_else(|| bad_field("last sequence number"))?);
                }
                TAG_COMPACT_POINTER => {
                    let level = get_level(&mut input).ok_or_else(|| bad_field("compaction pointer"))?;
                    let key = get_internal_key(&mut input).ok_or_else(|| bad_field("compaction pointer"))?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = get_level(&mut input).ok_or_else(|| bad_field("deleted file"))?;
                    let number = get_varint64(&mut input).ok_or_else(|| bad_field("deleted file"))?;
                    edit.deleted_files.insert((level, number));
                }
                TAG_NEW_FILE | TAG_NEW_FILE2 => {
                    let file = get_new_file(&mut input, tag == TAG_NEW_FILE2).ok_or_else(|| bad_field("new-file entry"))?;
                    edit.new_files.push((file.level, file));
                }
                _ => return Err(bad_field("unknown tag")),
            }
        }

        Ok(edit)
    }

    /// Multi-line human-readable rendering
    pub fn debug_string(&self) -> String {
        let mut r = String::from("VersionEdit {");
        if let Some(name) = &self.comparator {
            let _ = write!(r, "\n  Comparator: {}", name);
        }
        if let Some(n) = self.log_number {
            let _ = write!(r, "\n  LogNumber: {}", n);
        }
        if let Some(n) = self.prev_log_number {
            let _ = write!(r, "\n  PrevLogNumber: {}", n);
        }
        if let Some(n) = self.next_file_number {
            let _ = write!(r, "\n  NextFile: {}", n);
        }
        if let Some(n) = self.last_sequence {
            let _ = write!(r, "\n  LastSeq: {}", n);
        }
        for (level, key) in &self.compact_pointers {
            let _ = write!(r, "\n  CompactPointer: {} {:?}", level, key);
        }
        for (level, number) in &self.deleted_files {
            let _ = write!(r, "\n  DeleteFile: {} {}", level, number);
        }
        for (level, f) in &self.new_files {
            let _ = write!(
                r,
                "\n  AddFile: {} {} {} {:?} .. {:?}",
                level, f.number, f.file_size, f.smallest, f.largest
            );
        }
        r.push_str("\n}\n");
        r
    }
}

fn bad_field(what: &str) -> StrataError {
    StrataError::corruption(format!("VersionEdit: {}", what))
}

fn get_level(input: &mut &[u8]) -> Option<usize> {
    let level = get_varint32(input)? as usize;
    (level < NUM_LEVELS).then_some(level)
}

fn get_internal_key(input: &mut &[u8]) -> Option<InternalKey> {
    get_length_prefixed_slice(input).map(InternalKey::decode_from)
}

fn get_new_file(input: &mut &[u8], with_expiry: bool) -> Option<FileMetaData> {
    let level = get_level(input)?;
    let number = get_varint64(input)?;
    let file_size = get_varint64(input)?;
    let smallest = get_internal_key(input)?;
    let largest = get_internal_key(input)?;

    let mut file = FileMetaData::new(number, level, file_size, smallest, largest);
    if with_expiry {
        file.exp_write_low = get_varint64(input)?;
        file.exp_write_high = get_varint64(input)?;
        file.exp_explicit_high = get_varint64(input)?;
    }
    Some(file)
}
