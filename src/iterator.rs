//! Internal Iterators
//!
//! Every sorted source of internal keys (memtable, table file, level of
//! files, merged view) implements [`InternalIterator`], so compactions and
//! database iterators compose them freely.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::key::InternalKeyComparator;
use crate::storage::TableCache;
use crate::version::FileMetaData;

/// Forward iteration over internal keys in comparator order
pub trait InternalIterator: Send {
    /// True when positioned at an entry
    fn is_valid(&self) -> bool;

    fn seek_to_first(&mut self) -> Result<()>;

    /// Position at the first entry with key >= `target`
    fn seek(&mut self, target: &[u8]) -> Result<()>;

    fn next(&mut self) -> Result<()>;

    /// Current internal key. Only meaningful when `is_valid()`.
    fn key(&self) -> &[u8];

    /// Current value. Only meaningful when `is_valid()`.
    fn value(&self) -> &[u8];
}

// =============================================================================
// MergingIterator
// =============================================================================

/// K-way merge of child iterators
///
/// Children are listed newest first. Among identical internal keys the
/// earliest child wins the tie, which never happens in practice because
/// sequence numbers are unique.
pub struct MergingIterator {
    icmp: InternalKeyComparator,
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
}

impl MergingIterator {
    pub fn new(icmp: InternalKeyComparator, children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            icmp,
            children,
            current: None,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.is_valid() {
                continue;
            }
            smallest = match smallest {
                Some(s) if self.icmp.compare(child.key(), self.children[s].key()) != Ordering::Less => Some(s),
                _ => Some(i),
            };
        }
        self.current = smallest;
    }
}

impl InternalIterator for MergingIterator {
    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in self.children.iter_mut() {
            child.seek_to_first()?;
        }
        self.find_smallest();
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        for child in self.children.iter_mut() {
            child.seek(target)?;
        }
        self.find_smallest();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some(i) = self.current {
            self.children[i].next()?;
        }
        self.find_smallest();
        Ok(())
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].value(),
            None => &[],
        }
    }
}

// =============================================================================
// LevelIterator
// =============================================================================

/// Concatenates the files of a sorted level, opening each lazily
pub struct LevelIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    table_cache: Arc<TableCache>,
    index: usize,
    current: Option<Box<dyn InternalIterator>>,
}

impl LevelIterator {
    /// `files` must be disjoint and ordered by smallest key
    pub fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>, table_cache: Arc<TableCache>) -> Self {
        let index = files.len();
        Self {
            icmp,
            files,
            table_cache,
            index,
            current: None,
        }
    }

    fn open_file(&mut self, index: usize) -> Result<()> {
        self.index = index;
        self.current = match self.files.get(index) {
            Some(file) => Some(self.table_cache.new_iterator(file.number, file.level)?),
            None => None,
        };
        Ok(())
    }

    // Move forward past exhausted files.
    fn skip_empty_files(&mut self) -> Result<()> {
        while let Some(iter) = &self.current {
            if iter.is_valid() {
                break;
            }
            let next = self.index + 1;
            self.open_file(next)?;
            if let Some(iter) = self.current.as_mut() {
                iter.seek_to_first()?;
            }
        }
        Ok(())
    }
}

impl InternalIterator for LevelIterator {
    fn is_valid(&self) -> bool {
        self.current.as_ref().map_or(false, |i| i.is_valid())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.open_file(0)?;
        if let Some(iter) = self.current.as_mut() {
            iter.seek_to_first()?;
        }
        self.skip_empty_files()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let index = find_file(&self.icmp, &self.files, target);
        self.open_file(index)?;
        if let Some(iter) = self.current.as_mut() {
            iter.seek(target)?;
        }
        self.skip_empty_files()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(iter) = self.current.as_mut() {
            iter.next()?;
        }
        self.skip_empty_files()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |i| i.key())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |i| i.value())
    }
}

/// Index of the first file whose largest key is >= `key`, or `files.len()`
pub fn find_file(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>], key: &[u8]) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.encode(), key) == Ordering::Less)
}

// =============================================================================
// VecIterator
// =============================================================================

/// Iterator over an owned, already sorted list of entries
#[cfg(test)]
pub(crate) struct VecIterator {
    icmp: InternalKeyComparator,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

#[cfg(test)]
impl VecIterator {
    pub(crate) fn new(icmp: InternalKeyComparator, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let pos = entries.len();
        Self { icmp, entries, pos }
    }
}

#[cfg(test)]
impl InternalIterator for VecIterator {
    fn is_valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let icmp = &self.icmp;
        self.pos = self
            .entries
            .partition_point(|(k, _)| icmp.compare(k, target) == Ordering::Less);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.pos += 1;
        Ok(())
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }
}
