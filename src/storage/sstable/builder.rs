//! SSTable Builder
//!
//! Writes sorted internal-key entries to a new table file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::env::{Env, WritableFile};
use crate::error::Result;
use crate::expiry::ExpiryPolicy;
use crate::key::{extract_value_type, InternalKey, ValueType};

use super::{TableCounters, TableInfo, ENTRY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Builder for creating new SSTables from sorted entries
pub struct SSTableBuilder {
    /// Output file path
    path: PathBuf,
    env: Arc<dyn Env>,
    writer: Box<dyn WritableFile>,
    /// Current write position (for index)
    current_offset: u64,
    /// Index: internal key → file offset of entry
    index: Vec<(Vec<u8>, u64)>,
    smallest: Option<Vec<u8>>,
    largest: Option<Vec<u8>>,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
    counters: TableCounters,
    expiry: Option<Arc<dyn ExpiryPolicy>>,
}

impl SSTableBuilder {
    /// Create a new SSTable builder
    ///
    /// Writes the header immediately; call `add()` in internal-key order,
    /// then `finish()` to write the index and footer.
    pub fn new(env: Arc<dyn Env>, path: &Path, expiry: Option<Arc<dyn ExpiryPolicy>>) -> Result<Self> {
        let mut writer = env.new_writable_file(path)?;

        writer.append(MAGIC)?;
        writer.append(&VERSION.to_le_bytes())?;

        Ok(Self {
            path: path.to_path_buf(),
            env,
            writer,
            current_offset: HEADER_SIZE,
            index: Vec::new(),
            smallest: None,
            largest: None,
            data_hasher: crc32fast::Hasher::new(),
            counters: TableCounters::default(),
            expiry,
        })
    }

    /// Add an entry (must be called in internal-key order)
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.index.push((key.to_vec(), self.current_offset));

        if self.smallest.is_none() {
            self.smallest = Some(key.to_vec());
        }
        self.largest = Some(key.to_vec());

        self.counters.keys += 1;
        if extract_value_type(key) == Some(ValueType::Deletion) {
            self.counters.delete_count += 1;
        }
        if let Some(policy) = &self.expiry {
            policy.table_builder_callback(key, &mut self.counters);
        }

        let key_len_bytes = (key.len() as u32).to_le_bytes();
        let val_len_bytes = (value.len() as u32).to_le_bytes();

        self.writer.append(&key_len_bytes)?;
        self.writer.append(&val_len_bytes)?;
        self.writer.append(key)?;
        self.writer.append(value)?;

        self.data_hasher.update(&key_len_bytes);
        self.data_hasher.update(&val_len_bytes);
        self.data_hasher.update(key);
        self.data_hasher.update(value);

        self.current_offset += (ENTRY_HEADER_SIZE + key.len() + value.len()) as u64;
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.counters.keys
    }

    /// Bytes written so far (data section only)
    pub fn file_size(&self) -> u64 {
        self.current_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finish building: write index block, footer, and return metadata
    pub fn finish(mut self) -> Result<TableInfo> {
        let index_offset = self.current_offset;
        let mut index_size = 0u64;

        // Index block: [key_len(4)][offset(8)][key] for each entry
        for (key, offset) in &self.index {
            self.writer.append(&(key.len() as u32).to_le_bytes())?;
            self.writer.append(&offset.to_le_bytes())?;
            self.writer.append(key)?;
            index_size += 12 + key.len() as u64;
        }

        let data_crc = self.data_hasher.clone().finalize();

        self.writer.append(&self.counters.keys.to_le_bytes())?;
        self.writer.append(&index_offset.to_le_bytes())?;
        self.writer.append(&self.counters.delete_count.to_le_bytes())?;
        self.writer.append(&data_crc.to_le_bytes())?;
        self.writer.append(&[0u8; 4])?;

        self.writer.sync()?;

        Ok(TableInfo {
            entry_count: self.counters.keys,
            file_size: index_offset + index_size + FOOTER_SIZE,
            smallest: self.smallest.as_deref().map(InternalKey::decode_from).unwrap_or_default(),
            largest: self.largest.as_deref().map(InternalKey::decode_from).unwrap_or_default(),
            counters: self.counters,
        })
    }

    /// Drop the partially written file
    pub fn abandon(self) -> Result<()> {
        let Self { path, env, writer, .. } = self;
        drop(writer);
        env.remove_file(&path)
    }
}
