//! Version
//!
//! An immutable view of which table files make up each level. Levels below
//! `NUM_OVERLAP_LEVELS` may hold files with overlapping key ranges; every
//! deeper level is sorted by smallest key with disjoint files.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{LevelTraits, NUM_LEVELS};
use crate::error::{Result, StrataError};
use crate::expiry::ExpiryPolicy;
use crate::iterator::{find_file, InternalIterator, LevelIterator};
use crate::key::{
    InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType, MAX_SEQUENCE_NUMBER,
    VALUE_TYPE_FOR_SEEK,
};
use crate::storage::TableCache;

// =============================================================================
// FileMetaData
// =============================================================================

/// One table file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Entry count, only known while the file is built
    pub num_entries: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub level: usize,
    /// Oldest write time; 0 when plain values are present
    pub exp_write_low: u64,
    pub exp_write_high: u64,
    pub exp_explicit_high: u64,
}

impl FileMetaData {
    pub fn new(number: u64, level: usize, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        Self {
            number,
            file_size,
            num_entries: 0,
            smallest,
            largest,
            level,
            exp_write_low: 0,
            exp_write_high: 0,
            exp_explicit_high: 0,
        }
    }
}

/// Sum of file sizes
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

// =============================================================================
// Compaction Score
// =============================================================================

/// Result of the most recent compaction scoring pass over a version
#[derive(Debug, Clone, Default)]
pub struct CompactionScore {
    /// Last level examined and chosen, `None` before the first pass
    pub level: Option<usize>,
    pub score: f64,
    /// Low priority work that must not queue behind real compactions
    pub grooming: bool,
    /// A trivial move is not allowed for this job
    pub no_move: bool,
    /// Whole-file expiry job
    pub expire_file: bool,
    pub file_to_compact: Option<Arc<FileMetaData>>,
    pub file_to_compact_level: usize,
    /// Write penalty derived from this version's shape
    pub write_penalty: i32,
}

// =============================================================================
// Version
// =============================================================================

/// Immutable snapshot of every level's files
pub struct Version {
    icmp: InternalKeyComparator,
    traits: Arc<LevelTraits>,
    pub(crate) files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],
    /// Written by compaction selection under the database mutex
    score: Mutex<CompactionScore>,
}

impl Version {
    pub fn new(icmp: InternalKeyComparator, traits: Arc<LevelTraits>) -> Self {
        Self {
            icmp,
            traits,
            files: Default::default(),
            score: Mutex::new(CompactionScore::default()),
        }
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn traits(&self) -> &LevelTraits {
        &self.traits
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    pub fn compaction_score(&self) -> CompactionScore {
        self.score.lock().clone()
    }

    pub(crate) fn set_compaction_score(&self, score: CompactionScore) {
        *self.score.lock() = score;
    }

    pub fn write_penalty(&self) -> i32 {
        self.score.lock().write_penalty
    }

    pub(crate) fn set_write_penalty(&self, penalty: i32) {
        self.score.lock().write_penalty = penalty;
    }

    // =========================================================================
    // Point Lookup
    // =========================================================================

    /// Newest value for `key` visible at its sequence number
    ///
    /// Overlapped levels are probed newest file first; sorted levels by
    /// binary search. A deletion or expired record ends the search with
    /// `None`, exactly like a miss.
    pub fn get(
        &self,
        key: &LookupKey,
        table_cache: &TableCache,
        expiry: Option<&dyn ExpiryPolicy>,
    ) -> Result<Option<Vec<u8>>> {
        let ikey = key.internal_key();
        let user_key = key.user_key();
        let ucmp = self.icmp.user_comparator();

        for level in 0..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }

            let candidates: Vec<&Arc<FileMetaData>> = if self.traits.overlapped(level) {
                let mut hits: Vec<&Arc<FileMetaData>> = files
                    .iter()
                    .filter(|f| {
                        ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                            && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
                    })
                    .collect();
                hits.sort_by(|a, b| b.number.cmp(&a.number));
                hits
            } else {
                let index = find_file(&self.icmp, files, ikey);
                match files.get(index) {
                    Some(f) if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less => vec![f],
                    _ => Vec::new(),
                }
            };

            for file in candidates {
                let Some((found_key, value)) = table_cache.find(file.number, file.level, ikey)? else {
                    continue;
                };
                let parsed = ParsedInternalKey::parse(&found_key)
                    .ok_or_else(|| StrataError::corruption("corrupted internal key in table"))?;
                if ucmp.compare(parsed.user_key, user_key) != Ordering::Equal {
                    continue;
                }
                return Ok(match parsed.value_type {
                    ValueType::Deletion => None,
                    ValueType::ValueWriteTime | ValueType::ValueExplicitExpiry
                        if expiry.map_or(false, |p| p.key_retirement_callback(&parsed)) =>
                    {
                        None
                    }
                    _ => Some(value),
                });
            }
        }

        Ok(None)
    }

    // =========================================================================
    // Overlap Queries
    // =========================================================================

    /// True when some file in `level` overlaps the user-key range
    /// `[smallest, largest]`; `None` bounds are unbounded
    pub fn overlap_in_level(&self, level: usize, smallest: Option<&[u8]>, largest: Option<&[u8]>) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            self.traits.overlapped(level),
            &self.files[level],
            smallest,
            largest,
        )
    }

    /// Files in `level` overlapping the user-key range of `[begin, end]`
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        // Overlapped levels are merged as a whole.
        if self.traits.overlapped(level) {
            return self.files[level].clone();
        }

        let ucmp = self.icmp.user_comparator();
        let user_begin = begin.map(|k| k.user_key());
        let user_end = end.map(|k| k.user_key());

        self.files[level]
            .iter()
            .filter(|f| {
                let before = user_end.map_or(false, |e| ucmp.compare(f.smallest.user_key(), e) == Ordering::Greater);
                let after = user_begin.map_or(false, |b| ucmp.compare(f.largest.user_key(), b) == Ordering::Less);
                !before && !after
            })
            .cloned()
            .collect()
    }

    /// Deepest level a new memtable file covering `[smallest, largest]` can
    /// land in without overlapping anything or burdening its grandparents
    pub fn pick_level_for_memtable_output(&self, smallest: &[u8], largest: &[u8], level_limit: usize) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest), Some(largest)) {
            let start = InternalKey::new(smallest, 0, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            let limit = InternalKey::new(largest, 0, 0, ValueType::Deletion);

            while level < level_limit && level + 1 < NUM_LEVELS {
                if self.overlap_in_level(level + 1, Some(smallest), Some(largest)) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let overlaps = self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                    if total_file_size(&overlaps) > self.traits.max_grandparent_overlap_bytes(level) {
                        break;
                    }
                }
                level += 1;
            }

            // Overlapped levels only accept memtable output at level 0.
            if self.traits.overlapped(level) {
                level = 0;
            }
        }
        level
    }

    /// First sorted level at or after `start_level` holding overlapping
    /// files; returns the level and the range of the earlier file
    pub fn verify_levels(&self, start_level: usize) -> Option<(usize, InternalKey, InternalKey)> {
        let ucmp = self.icmp.user_comparator();
        let mut level = start_level;

        while level + 1 < NUM_LEVELS {
            let files = &self.files[level];
            if !self.traits.overlapped(level) && files.len() > 1 {
                for (outer, outer_meta) in files.iter().enumerate() {
                    let outer_limit = outer_meta.largest.user_key();
                    let clash = files[outer + 1..]
                        .iter()
                        .any(|inner| ucmp.compare(inner.smallest.user_key(), outer_limit) != Ordering::Greater);
                    if clash {
                        return Some((level, outer_meta.smallest.clone(), outer_meta.largest.clone()));
                    }
                }
            }
            level += 1;
        }
        None
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// One iterator per overlapped-level file, one concatenating iterator
    /// per non-empty sorted level
    pub fn add_iterators(
        &self,
        table_cache: &Arc<TableCache>,
        iters: &mut Vec<Box<dyn InternalIterator>>,
    ) -> Result<()> {
        for level in 0..NUM_LEVELS {
            let files = &self.files[level];
            if self.traits.overlapped(level) {
                for f in files {
                    iters.push(table_cache.new_iterator(f.number, f.level)?);
                }
            } else if !files.is_empty() {
                iters.push(Box::new(LevelIterator::new(
                    self.icmp.clone(),
                    files.clone(),
                    Arc::clone(table_cache),
                )));
            }
        }
        Ok(())
    }

    /// Per-level file listing:
    /// ```text
    /// --- level 2 ---
    ///  17:1234['a' @ 5 : 1 .. 'd' @ 9 : 1]
    /// ```
    pub fn debug_string(&self) -> String {
        let mut r = String::new();
        for level in 0..NUM_LEVELS {
            let _ = writeln!(r, "--- level {} ---", level);
            for f in &self.files[level] {
                let _ = writeln!(r, " {}:{}[{:?} .. {:?}]", f.number, f.file_size, f.smallest, f.largest);
            }
        }
        r
    }
}

/// Overlap test over one level's file list
///
/// For sorted levels a binary search finds the only candidate file.
pub(crate) fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    overlapped: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();

    // Key range entirely after the file
    let after_file = |f: &FileMetaData| {
        smallest_user_key.map_or(false, |k| ucmp.compare(k, f.largest.user_key()) == Ordering::Greater)
    };
    // Key range entirely before the file
    let before_file = |f: &FileMetaData| {
        largest_user_key.map_or(false, |k| ucmp.compare(k, f.smallest.user_key()) == Ordering::Less)
    };

    if overlapped {
        return files.iter().any(|f| !after_file(f) && !before_file(f));
    }

    let index = match smallest_user_key {
        Some(k) => {
            let small = InternalKey::new(k, 0, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small.encode())
        }
        None => 0,
    };

    match files.get(index) {
        Some(f) => !before_file(f),
        None => false,
    }
}
