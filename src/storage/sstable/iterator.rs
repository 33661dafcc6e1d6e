//! SSTable Iterator
//!
//! Seekable iteration over all entries in an SSTable.

use std::sync::Arc;

use crate::error::Result;
use crate::iterator::InternalIterator;

use super::SSTableReader;

/// Iterator over SSTable entries in internal-key order
pub struct SSTableIterator {
    table: Arc<SSTableReader>,
    pos: usize,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl SSTableIterator {
    pub(super) fn new(table: Arc<SSTableReader>) -> Self {
        let pos = table.len();
        Self {
            table,
            pos,
            current: None,
        }
    }

    fn load(&mut self) -> Result<()> {
        self.current = if self.pos < self.table.len() {
            Some(self.table.read_entry(self.pos)?)
        } else {
            None
        };
        Ok(())
    }
}

impl InternalIterator for SSTableIterator {
    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.pos = 0;
        self.load()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.pos = self.table.seek_position(target);
        self.load()
    }

    fn next(&mut self) -> Result<()> {
        self.pos += 1;
        self.load()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(k, _)| k.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(_, v)| v.as_slice())
    }
}
