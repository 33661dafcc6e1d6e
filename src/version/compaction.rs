//! Compaction
//!
//! Inputs and output limits of one compaction job. A compaction merges
//! `inputs[0]` (files of `level`) with `inputs[1]` (overlapping files of
//! `level + 1`) into new files at `level + 1`.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{MAX_KEYS_PER_OUTPUT_FILE, NUM_LEVELS};
use crate::version::{total_file_size, FileMetaData, Version, VersionEdit};

/// What a compaction job does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionKind {
    /// Merge inputs into the next level
    Normal,
    /// Delete whole expired files of `level`, no merging
    ExpiryFile,
}

/// One compaction job
pub struct Compaction {
    level: usize,
    kind: CompactionKind,
    max_output_file_size: u64,
    input_version: Arc<Version>,
    edit: VersionEdit,
    no_move: bool,

    /// `inputs[0]` from `level`, `inputs[1]` from `level + 1`
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Files of `level + 2` overlapping the compaction range
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,

    // State for should_stop_before
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // State for is_base_level_for_key: per level, the first file whose
    // largest key may still reach the keys being compacted
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub fn new(level: usize, input_version: Arc<Version>) -> Self {
        let max_output_file_size = input_version.traits().max_file_size_for_level(level);
        Self {
            level,
            kind: CompactionKind::Normal,
            max_output_file_size,
            input_version,
            edit: VersionEdit::new(),
            no_move: false,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    /// Source level; outputs go to `level() + 1`
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn kind(&self) -> CompactionKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: CompactionKind) {
        self.kind = kind;
    }

    pub fn edit(&self) -> &VersionEdit {
        &self.edit
    }

    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn inputs(&self, which: usize) -> &[Arc<FileMetaData>] {
        &self.inputs[which]
    }

    pub fn grandparents(&self) -> &[Arc<FileMetaData>] {
        &self.grandparents
    }

    /// Output files are cut once they reach this size
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn no_move(&self) -> bool {
        self.no_move
    }

    pub(crate) fn set_no_move(&mut self, value: bool) {
        self.no_move = value;
    }

    pub fn is_move_ok(&self) -> bool {
        !self.no_move
    }

    /// True when the single input file can simply be renamed into the next
    /// level without merging
    pub fn is_trivial_move(&self) -> bool {
        let traits = self.input_version.traits();
        !traits.overlapped(self.level)
            && self.is_move_ok()
            && self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= traits.max_grandparent_overlap_bytes(self.level)
    }

    /// Record the deletion of every input file in `edit`
    pub fn add_input_deletions(&self, edit: &mut VersionEdit) {
        for (which, files) in self.inputs.iter().enumerate() {
            for f in files {
                edit.delete_file(self.level + which, f.number);
            }
        }
    }

    /// True when no level below the output level can hold `user_key`
    ///
    /// Must be called with user keys in ascending order.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let traits = self.input_version.traits();
        if traits.overlapped(self.level) || traits.overlapped(self.level + 1) {
            return false;
        }

        let ucmp = self.input_version.comparator().user_comparator();
        for lvl in (self.level + 2)..NUM_LEVELS {
            let files = self.input_version.files(lvl);
            while let Some(f) = files.get(self.level_ptrs[lvl]) {
                if ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[lvl] += 1;
            }
        }
        true
    }

    /// True when the output file should be closed before `internal_key` is
    /// added, given `key_count` keys already in it
    ///
    /// Only outputs into sorted levels are cut, either by grandparent overlap
    /// or by key count.
    pub fn should_stop_before(&mut self, internal_key: &[u8], key_count: u64) -> bool {
        let traits = self.input_version.traits();
        if traits.overlapped(self.level + 1) {
            return false;
        }

        let icmp = self.input_version.comparator();
        while let Some(gp) = self.grandparents.get(self.grandparent_index) {
            if icmp.compare(internal_key, gp.largest.encode()) != Ordering::Greater {
                break;
            }
            if self.seen_key {
                self.overlapped_bytes += gp.file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        let stop = self.overlapped_bytes > traits.max_grandparent_overlap_bytes(self.level)
            || key_count > MAX_KEYS_PER_OUTPUT_FILE;
        if stop {
            self.overlapped_bytes = 0;
        }
        stop
    }
}
