//! Table Cache
//!
//! Keeps table readers open so lookups do not reload indexes.
//!
//! ## Concurrency:
//! - `tables`: Protected by a Mutex held only for map access, never I/O
//! - Readers are `Arc`s; an iterator keeps its reader alive after eviction

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::env::Env;
use crate::error::Result;
use crate::filename::table_file_name;
use crate::iterator::InternalIterator;
use crate::key::InternalKeyComparator;

use super::SSTableReader;

/// Open table readers, keyed by file number
pub struct TableCache {
    dbname: PathBuf,
    env: Arc<dyn Env>,
    icmp: InternalKeyComparator,
    tables: Mutex<HashMap<u64, Arc<SSTableReader>>>,
}

impl TableCache {
    pub fn new(dbname: &Path, env: Arc<dyn Env>, icmp: InternalKeyComparator) -> Self {
        Self {
            dbname: dbname.to_path_buf(),
            env,
            icmp,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Reader for file `number`, opened from the directory of `level`
    pub fn get(&self, number: u64, level: usize) -> Result<Arc<SSTableReader>> {
        if let Some(table) = self.tables.lock().get(&number) {
            return Ok(Arc::clone(table));
        }

        // Open outside the lock; a racing open of the same file is harmless.
        let path = table_file_name(&self.dbname, number, level);
        let table = Arc::new(SSTableReader::open(self.env.as_ref(), &path, self.icmp.clone())?);
        debug!(file_number = number, level, entries = table.entry_count(), "Opened table");

        let mut tables = self.tables.lock();
        let entry = tables.entry(number).or_insert(table);
        Ok(Arc::clone(entry))
    }

    /// First entry >= `internal_key` in file `number`
    pub fn find(&self, number: u64, level: usize, internal_key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.get(number, level)?.get(internal_key)
    }

    pub fn new_iterator(&self, number: u64, level: usize) -> Result<Box<dyn InternalIterator>> {
        Ok(Box::new(self.get(number, level)?.iter()))
    }

    /// Tombstone count of file `number`, 0 when it cannot be opened
    pub fn delete_count(&self, number: u64, level: usize) -> u64 {
        self.get(number, level).map_or(0, |t| t.delete_count())
    }

    /// Forget the reader for a deleted or moved file
    pub fn evict(&self, number: u64) {
        self.tables.lock().remove(&number);
    }

    /// Number of open readers
    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.lock().is_empty()
    }
}
