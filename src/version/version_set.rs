//! Version Set
//!
//! Owns the current [`Version`], the manifest log, and file numbering, and
//! decides which compactions run next.
//!
//! ## Concurrency:
//! - The set itself lives inside the database state, behind the database mutex
//! - The manifest writer sits behind its own mutex; `log_and_apply` installs
//!   the new version first, then releases the database mutex while the edit
//!   is appended and synced
//! - Versions are `Arc`s; the set keeps `Weak` handles to find every file
//!   still referenced by a reader or compaction

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{LevelTraits, Options, MAX_OVERLAPPED_INPUTS, NUM_LEVELS, NUM_OVERLAP_LEVELS};
use crate::env::Env;
use crate::error::{Result, StrataError};
use crate::filename::{descriptor_file_name, read_current_file, set_current_file};
use crate::iterator::{InternalIterator, LevelIterator, MergingIterator};
use crate::key::{InternalKey, InternalKeyComparator, SequenceNumber};
use crate::storage::TableCache;
use crate::wal::{LogReader, LogWriter, Reporter};

use super::{total_file_size, Compaction, CompactionKind, CompactionScore, FileMetaData, Version, VersionEdit};

/// Minimum spacing between write-penalty adjustments
const PENALTY_INTERVAL_MICROS: u64 = 15 * 1_000_000;

/// Ceiling of the write penalty
const MAX_WRITE_PENALTY: i32 = 1000;

// =============================================================================
// Compaction Status
// =============================================================================

/// Per-level bookkeeping of in-flight compactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStatus {
    /// Handed to a thread pool
    pub submitted: bool,
    /// A worker is executing it
    pub running: bool,
    /// Clock micros when the last compaction of this level finished
    pub last_compaction: u64,
}

// =============================================================================
// VersionSet
// =============================================================================

pub struct VersionSet {
    dbname: PathBuf,
    env: Arc<dyn Env>,
    options: Arc<Options>,
    table_cache: Arc<TableCache>,
    icmp: InternalKeyComparator,
    traits: Arc<LevelTraits>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    /// Log being flushed when the process stopped, 0 when none
    prev_log_number: u64,

    /// Manifest writer, serialized by its own mutex
    descriptor_log: Arc<Mutex<Option<LogWriter>>>,

    current: Arc<Version>,
    /// Every version ever installed that may still be referenced
    live: Vec<Weak<Version>>,

    /// Per level: largest key of the last compaction, encoded
    compact_pointer: [Vec<u8>; NUM_LEVELS],
    status: [CompactionStatus; NUM_LEVELS],

    prev_write_penalty: i32,
    next_penalty_update: u64,
}

impl AsMut<VersionSet> for VersionSet {
    fn as_mut(&mut self) -> &mut VersionSet {
        self
    }
}

impl VersionSet {
    pub fn new(dbname: &Path, options: Arc<Options>, table_cache: Arc<TableCache>, icmp: InternalKeyComparator) -> Self {
        let traits = Arc::new(options.level_traits.clone());
        let current = Arc::new(Version::new(icmp.clone(), Arc::clone(&traits)));
        Self {
            dbname: dbname.to_path_buf(),
            env: Arc::clone(&options.env),
            options,
            table_cache,
            icmp,
            traits,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: Arc::new(Mutex::new(None)),
            live: vec![Arc::downgrade(&current)],
            current,
            compact_pointer: Default::default(),
            status: [CompactionStatus::default(); NUM_LEVELS],
            prev_write_penalty: 0,
            next_penalty_update: 0,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn traits(&self) -> &LevelTraits {
        &self.traits
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Return `number` to the pool when it was the last one handed out
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        self.current.level_bytes(level)
    }

    pub fn is_level_overlapped(&self, level: usize) -> bool {
        self.traits.overlapped(level)
    }

    /// `files[ n0 n1 n2 n3 n4 n5 n6 ]`
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = (0..NUM_LEVELS).map(|l| self.current.num_files(l).to_string()).collect();
        format!("files[ {} ]", counts.join(" "))
    }

    /// `files[ submitted,running ... ]` per level, as 0/1
    pub fn compaction_summary(&self) -> String {
        let states: Vec<String> = self
            .status
            .iter()
            .map(|s| format!("{},{}", s.submitted as u8, s.running as u8))
            .collect();
        format!("files[ {} ]", states.join(" "))
    }

    // =========================================================================
    // Compaction Status
    // =========================================================================

    pub fn compaction_status(&self, level: usize) -> CompactionStatus {
        self.status[level]
    }

    pub fn is_compaction_submitted(&self, level: usize) -> bool {
        self.status[level].submitted
    }

    pub fn set_compaction_submitted(&mut self, level: usize) {
        self.status[level].submitted = true;
    }

    pub fn set_compaction_running(&mut self, level: usize) {
        self.status[level].running = true;
    }

    /// Clear the flags of `level`; both it and its target level remember `now`
    pub fn set_compaction_done(&mut self, level: usize, now: u64) {
        self.status[level].running = false;
        self.status[level].submitted = false;
        self.status[level].last_compaction = now;
        if level + 1 < NUM_LEVELS {
            self.status[level + 1].last_compaction = now;
        }
    }

    /// True when neither neighbor of the sorted `level` is being compacted
    /// and its parent is not overfull
    pub fn neighbor_compactions_quiet(&self, level: usize) -> bool {
        let last = NUM_LEVELS - 1;
        let parent_level_bytes = if level < last { self.current.level_bytes(level + 1) } else { 0 };

        (level == 0 || !self.status[level - 1].submitted)
            && !self.traits.overlapped(level)
            && (level == last
                || (!self.status[level + 1].submitted
                    && parent_level_bytes
                        <= (self.traits.max_bytes_for_level(level + 1) + self.traits.desired_bytes_for_level(level + 1))
                            / 2))
    }

    // =========================================================================
    // Installing Versions
    // =========================================================================

    /// Apply `edit` to the current version, install the result and persist
    /// the edit in the manifest
    ///
    /// The database mutex held by `guard` is released while the manifest is
    /// written and re-acquired before returning.
    pub fn log_and_apply<S: AsMut<VersionSet>>(guard: &mut MutexGuard<'_, S>, edit: &mut VersionEdit) -> Result<()> {
        let vset: &mut VersionSet = (**guard).as_mut();

        match edit.log_number() {
            Some(n) => debug_assert!(n >= vset.log_number && n < vset.next_file_number),
            None => edit.set_log_number(vset.log_number),
        }
        if edit.prev_log_number().is_none() {
            edit.set_prev_log_number(vset.prev_log_number);
        }
        edit.set_next_file(vset.next_file_number);
        edit.set_last_sequence(vset.last_sequence);

        let version = vset.build_version(std::slice::from_ref(&*edit));

        // The first edit after open starts a fresh manifest holding a
        // snapshot of the current state.
        let mut new_manifest: Option<PathBuf> = None;
        if vset.descriptor_log.lock().is_none() {
            let path = descriptor_file_name(&vset.dbname, vset.manifest_file_number);
            edit.set_next_file(vset.next_file_number);
            match vset.create_manifest(&path) {
                Ok(writer) => {
                    *vset.descriptor_log.lock() = Some(writer);
                    new_manifest = Some(path);
                }
                Err(e) => {
                    let _ = vset.env.remove_file(&path);
                    return Err(e);
                }
            }
        }

        vset.append_version(version);
        vset.log_number = edit.log_number().unwrap_or(vset.log_number);
        vset.prev_log_number = edit.prev_log_number().unwrap_or(vset.prev_log_number);

        let mut record = Vec::new();
        edit.encode_to(&mut record, vset.options.expiry_activated());

        let descriptor_log = Arc::clone(&vset.descriptor_log);
        let env = Arc::clone(&vset.env);
        let dbname = vset.dbname.clone();
        let manifest_number = vset.manifest_file_number;

        let result = MutexGuard::unlocked(guard, || -> Result<()> {
            let mut log = descriptor_log.lock();
            let writer = log
                .as_mut()
                .ok_or_else(|| StrataError::io("manifest log is not open"))?;
            writer.add_record(&record)?;
            writer.sync()?;
            if new_manifest.is_some() {
                set_current_file(env.as_ref(), &dbname, manifest_number)?;
            }
            Ok(())
        });

        if let Err(e) = &result {
            warn!(error = %e, "MANIFEST write failed");
            if let Some(path) = &new_manifest {
                let vset: &mut VersionSet = (**guard).as_mut();
                *vset.descriptor_log.lock() = None;
                let _ = vset.env.remove_file(path);
            }
        }
        result
    }

    /// Rebuild state from the manifest named by CURRENT
    pub fn recover(&mut self) -> Result<()> {
        let current = read_current_file(self.env.as_ref(), &self.dbname)?;
        let manifest_path = self.dbname.join(&current);
        let contents = self.env.read_file(&manifest_path)?;

        let mut reporter = ManifestReporter::default();
        let mut edits = Vec::new();
        let mut log_number: Option<u64> = None;
        let mut prev_log_number: Option<u64> = None;
        let mut next_file: Option<u64> = None;
        let mut last_sequence: Option<SequenceNumber> = None;

        {
            let mut reader = LogReader::new(contents, &mut reporter, true);
            while let Some(record) = reader.read_record() {
                let edit = VersionEdit::decode_from(&record)?;
                if let Some(name) = edit.comparator_name() {
                    let expected = self.icmp.user_comparator().name();
                    if name != expected {
                        return Err(StrataError::invalid_argument(format!(
                            "{} does not match existing comparator {}",
                            expected, name
                        )));
                    }
                }

                // Concurrent compactions may append their edits out of
                // install order, so counters take the maximum seen.
                log_number = max_option(log_number, edit.log_number());
                prev_log_number = max_option(prev_log_number, edit.prev_log_number());
                next_file = max_option(next_file, edit.next_file_number());
                last_sequence = max_option(last_sequence, edit.last_sequence());
                edits.push(edit);
            }
        }
        if let Some(e) = reporter.error {
            return Err(e);
        }

        let next_file = next_file.ok_or_else(|| StrataError::corruption("no meta-nextfile entry in descriptor"))?;
        let log_number = log_number.ok_or_else(|| StrataError::corruption("no meta-lognumber entry in descriptor"))?;
        let last_sequence =
            last_sequence.ok_or_else(|| StrataError::corruption("no last-sequence-number entry in descriptor"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        let version = self.build_version(&edits);
        self.append_version(version);
        self.manifest_file_number = next_file.max(self.next_file_number);
        self.next_file_number = self.manifest_file_number + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        info!(
            manifest = %current,
            edits = edits.len(),
            next_file = self.next_file_number,
            last_sequence,
            log_number,
            "Recovered version set"
        );
        Ok(())
    }

    fn build_version(&mut self, edits: &[VersionEdit]) -> Version {
        let mut builder = Builder::new(&self.icmp, Arc::clone(&self.current));
        for edit in edits {
            builder.apply(edit, &mut self.compact_pointer);
        }
        builder.save_to(Arc::clone(&self.traits))
    }

    fn append_version(&mut self, version: Version) {
        let version = Arc::new(version);
        self.live.retain(|v| v.strong_count() > 0);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }

    fn create_manifest(&self, path: &Path) -> Result<LogWriter> {
        let file = self.env.new_writable_file(path)?;
        let mut writer = LogWriter::new(file);
        self.write_snapshot(&mut writer)?;
        Ok(writer)
    }

    /// Write the whole current state as one edit
    fn write_snapshot(&self, log: &mut LogWriter) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());

        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if !pointer.is_empty() {
                edit.set_compact_pointer(level, InternalKey::decode_from(pointer));
            }
        }

        for level in 0..NUM_LEVELS {
            for f in self.current.files(level) {
                edit.add_file(level, FileMetaData::clone(f));
            }
        }

        let mut record = Vec::new();
        edit.encode_to(&mut record, self.options.expiry_activated());
        log.add_record(&record)
    }

    /// Numbers of every table referenced by any live version
    pub fn live_files(&self) -> HashSet<u64> {
        let mut live = HashSet::new();
        for version in self.live.iter().filter_map(Weak::upgrade) {
            for level in 0..NUM_LEVELS {
                live.extend(version.files(level).iter().map(|f| f.number));
            }
        }
        live
    }

    // =========================================================================
    // Size Estimates
    // =========================================================================

    /// Approximate byte offset of `ikey` within the whole database
    pub fn approximate_offset_of(&self, v: &Version, ikey: &InternalKey) -> u64 {
        let mut result = 0;
        for level in 0..NUM_LEVELS {
            for f in v.files(level) {
                if self.icmp.compare_keys(&f.largest, ikey) != Ordering::Greater {
                    result += f.file_size;
                } else if self.icmp.compare_keys(&f.smallest, ikey) == Ordering::Greater {
                    // Later files of a sorted level start even further right
                    if !self.traits.overlapped(level) {
                        break;
                    }
                } else if let Ok(table) = self.table_cache.get(f.number, f.level) {
                    result += table.approximate_offset_of(ikey.encode());
                }
            }
        }
        result
    }

    /// Largest number of next-level bytes overlapping one file of levels 1..
    pub fn max_next_level_overlapping_bytes(&self) -> u64 {
        let mut result = 0;
        for level in 1..NUM_LEVELS - 1 {
            for f in self.current.files(level) {
                let overlaps = self
                    .current
                    .get_overlapping_inputs(level + 1, Some(&f.smallest), Some(&f.largest));
                result = result.max(total_file_size(&overlaps));
            }
        }
        result
    }

    /// Smallest and largest internal keys covered by `inputs`
    fn get_range<'a>(&self, inputs: impl IntoIterator<Item = &'a Arc<FileMetaData>>) -> (InternalKey, InternalKey) {
        let mut smallest: Option<&InternalKey> = None;
        let mut largest: Option<&InternalKey> = None;
        for f in inputs {
            if smallest.map_or(true, |s| self.icmp.compare_keys(&f.smallest, s) == Ordering::Less) {
                smallest = Some(&f.smallest);
            }
            if largest.map_or(true, |l| self.icmp.compare_keys(&f.largest, l) == Ordering::Greater) {
                largest = Some(&f.largest);
            }
        }
        (smallest.cloned().unwrap_or_default(), largest.cloned().unwrap_or_default())
    }

    // =========================================================================
    // Write Penalty
    // =========================================================================

    /// Recompute the write penalty for `v`, moving the smoothed value at
    /// most once per interval
    pub fn update_penalty(&mut self, v: &Version) {
        let target = compute_penalty(
            v,
            self.options.l0_slowdown_writes_trigger,
            self.options.l0_compaction_trigger,
            self.options.write_buffer_size as u64,
        );

        let now = self.env.now_micros();
        if self.next_penalty_update < now {
            self.next_penalty_update = now + PENALTY_INTERVAL_MICROS;
            self.prev_write_penalty = smooth_penalty(self.prev_write_penalty, target);
        }

        v.set_write_penalty(self.prev_write_penalty);
    }

    /// Per-batch-key write delay in micros derived from the penalty and the
    /// throttle's current and unadjusted rates
    pub fn write_throttle_usec(&self, rate: u64, unadjusted_rate: u64) -> u64 {
        let penalty = self.current.write_penalty().max(0) as u64;
        if penalty == 0 {
            if rate != 1 {
                rate
            } else {
                0
            }
        } else {
            let throttle = if rate == 1 { unadjusted_rate } else { rate };
            penalty * throttle
        }
    }

    // =========================================================================
    // Compaction Selection
    // =========================================================================

    /// Find the next level of `v` needing work, starting after the level
    /// found by the previous call. Returns false when none remains.
    pub fn finalize(&mut self, v: &Version, user_db_count: usize) -> bool {
        let prior = v.compaction_score();
        let start = prior.level.map_or(0, |l| l + 1);
        let last = NUM_LEVELS - 1;

        let mut found = false;
        let mut best_level = None;
        let mut best_score = -1.0;
        let mut is_grooming = false;
        let mut no_move = false;
        let mut expire_file = false;
        let mut file_to_compact = None;
        let mut file_to_compact_level = prior.file_to_compact_level;

        let mut level = start;
        while level < NUM_LEVELS && !found {
            let mut score = 0.0;
            is_grooming = false;

            let mut compact_ok = !self.status[level].submitted;
            if compact_ok {
                let parent_level_bytes = if level < last { v.level_bytes(level + 1) } else { 0 };
                let overlapped = self.traits.overlapped(level);
                let next_overlapped = level < last && self.traits.overlapped(level + 1);

                if overlapped && next_overlapped {
                    // merging between overlapped levels is always allowed
                } else if overlapped
                    && level < last
                    && !self.status[level + 1].submitted
                    && (parent_level_bytes <= self.traits.desired_bytes_for_level(level + 1)
                        || self.options.l0_compaction_trigger <= v.num_files(level))
                {
                    // landing level has room
                } else {
                    compact_ok = self.neighbor_compactions_quiet(level);
                }
            }

            if compact_ok {
                // Timed grooming is disabled; the base trigger always applies.
                let grooming_trigger = self.options.l0_grooming_trigger;
                let files = v.num_files(level);

                if self.traits.overlapped(level) {
                    if self.options.l0_compaction_trigger <= files {
                        score = (files - self.options.l0_compaction_trigger + 1) as f64;
                    }

                    // Early, low-priority merge while the landing level has room
                    if score == 0.0
                        && grooming_trigger <= files
                        && user_db_count > 2
                        && v.level_bytes(NUM_OVERLAP_LEVELS) < self.traits.desired_bytes_for_level(NUM_OVERLAP_LEVELS)
                        && (level == last
                            || !self.traits.overlapped(level + 1)
                            || v.num_files(level + 1) <= self.options.l0_compaction_trigger)
                    {
                        score = 1.0;
                        is_grooming = true;
                    }
                } else if level < last {
                    let level_bytes = v.level_bytes(level);
                    score = level_bytes as f64 / self.traits.desired_bytes_for_level(level) as f64;
                    is_grooming = level_bytes < self.traits.max_file_size_for_level(level);

                    // the landing level is never groomed
                    if level > 0 && self.traits.overlapped(level - 1) {
                        is_grooming = false;
                    }

                    if score < 1.0 && self.options.delete_threshold != 0 {
                        for f in v.files(level) {
                            if self.options.delete_threshold <= self.table_cache.delete_count(f.number, f.level) {
                                found = true;
                                best_level = Some(level);
                                best_score = 0.0;
                                file_to_compact = Some(Arc::clone(f));
                                file_to_compact_level = level;
                                is_grooming = true;
                                no_move = true;
                                break;
                            }
                        }
                    }
                }

                if score >= 1.0 {
                    best_level = Some(level);
                    best_score = score;
                    found = true;
                }

                if !found {
                    if let Some(policy) = self.options.expiry.as_ref().filter(|p| p.expiry_activated()) {
                        if policy.compaction_finalize_callback(false, v, level, None) {
                            found = true;
                            best_level = Some(level);
                            best_score = 0.0;
                            is_grooming = false;
                            no_move = true;
                            expire_file = true;
                            file_to_compact_level = level;
                        }
                    }
                }
            }

            level += 1;
        }

        v.set_compaction_score(CompactionScore {
            level: best_level,
            score: best_score,
            grooming: is_grooming,
            no_move,
            expire_file,
            file_to_compact,
            file_to_compact_level,
            write_penalty: prior.write_penalty,
        });
        found
    }

    /// Choose every compaction the current version needs and offer each to
    /// `submit(compaction, ok_to_queue)`, which reports whether it was taken
    pub fn pick_compaction(&mut self, user_db_count: usize, submit: &mut dyn FnMut(Compaction, bool) -> bool) {
        let current = Arc::clone(&self.current);
        self.update_penalty(&current);

        let mut reset = current.compaction_score();
        reset.level = None;
        current.set_compaction_score(reset);

        while self.finalize(&current, user_db_count) {
            let score = current.compaction_score();
            debug!(level = ?score.level, grooming = score.grooming, "Finalize level");

            let (level, mut c) = if score.score >= 1.0 {
                let Some(level) = score.level else { return };
                let mut c = Compaction::new(level, Arc::clone(&current));

                // First file past the round-robin cursor, or wrap around
                let pointer = &self.compact_pointer[level];
                let files = current.files(level);
                let pick = files
                    .iter()
                    .find(|f| pointer.is_empty() || self.icmp.compare(f.largest.encode(), pointer) == Ordering::Greater)
                    .or_else(|| files.first());
                let Some(pick) = pick else { return };
                c.inputs[0].push(Arc::clone(pick));
                (level, c)
            } else if let Some(f) = &score.file_to_compact {
                let level = score.file_to_compact_level;
                let mut c = Compaction::new(level, Arc::clone(&current));
                c.inputs[0].push(Arc::clone(f));
                (level, c)
            } else if score.expire_file {
                let level = score.file_to_compact_level;
                let mut c = Compaction::new(level, Arc::clone(&current));
                c.set_kind(CompactionKind::ExpiryFile);
                (level, c)
            } else {
                return;
            };

            c.set_no_move(score.no_move);
            self.status[level].submitted = true;

            let ok_to_queue = if c.kind() == CompactionKind::ExpiryFile {
                true
            } else {
                if self.traits.overlapped(level) {
                    let (smallest, largest) = self.get_range(c.inputs[0].iter());
                    let mut inputs = current.get_overlapping_inputs(level, Some(&smallest), Some(&largest));

                    // Keep the merge fan-in sane after a repair
                    if inputs.len() > MAX_OVERLAPPED_INPUTS {
                        let ucmp = self.icmp.user_comparator();
                        inputs.sort_by(|a, b| ucmp.compare(a.smallest.user_key(), b.smallest.user_key()));
                        inputs.truncate(MAX_OVERLAPPED_INPUTS);
                    }
                    c.inputs[0] = inputs;
                }
                self.setup_other_inputs(&mut c);
                !score.grooming
            };

            self.status[level].submitted = submit(c, ok_to_queue);
        }
    }

    /// Fill in `inputs[1]` and grandparents, widening `inputs[0]` when the
    /// next-level input set allows it
    pub fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level();
        let version = Arc::clone(c.input_version());
        let (mut smallest, mut largest) = self.get_range(c.inputs[0].iter());

        if !self.traits.overlapped(level + 1) {
            c.inputs[1] = version.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

            let (mut all_start, mut all_limit) = self.get_range(c.inputs[0].iter().chain(c.inputs[1].iter()));

            if !c.inputs[1].is_empty() {
                let expanded0 = version.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
                let inputs1_size = total_file_size(&c.inputs[1]);
                let expanded0_size = total_file_size(&expanded0);

                if expanded0.len() > c.inputs[0].len()
                    && inputs1_size + expanded0_size < self.traits.expanded_compaction_byte_size_limit(level)
                {
                    let (new_start, new_limit) = self.get_range(expanded0.iter());
                    let expanded1 = version.get_overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                    if expanded1.len() == c.inputs[1].len() {
                        debug!(
                            level,
                            from = c.inputs[0].len(),
                            to = expanded0.len(),
                            parents = expanded1.len(),
                            "Expanding compaction inputs"
                        );
                        smallest = new_start;
                        largest = new_limit;
                        c.inputs[0] = expanded0;
                        c.inputs[1] = expanded1;
                        let range = self.get_range(c.inputs[0].iter().chain(c.inputs[1].iter()));
                        all_start = range.0;
                        all_limit = range.1;
                    }
                }
            }

            if level + 2 < NUM_LEVELS {
                c.grandparents = version.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
            }
        } else {
            // Into an overlapped level: take the whole source level
            let files = version.files(level);
            if c.inputs[0].len() <= self.options.l0_stop_writes_trigger && c.inputs[0].len() != files.len() {
                c.inputs[0] = files.to_vec();
                let range = self.get_range(c.inputs[0].iter());
                smallest = range.0;
                largest = range.1;
            }
        }

        debug!(level, smallest = ?smallest, largest = ?largest, "Compaction range");

        // Advance the cursor now so a failed compaction tries another range
        self.compact_pointer[level] = largest.encode().to_vec();
        c.edit_mut().set_compact_pointer(level, largest);
    }

    /// Compaction of the files of `level` overlapping `[begin, end]`, capped
    /// at one output file's worth of input
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let mut inputs = self.current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        let limit = self.traits.max_file_size_for_level(level);
        let mut total = 0;
        for (i, f) in inputs.iter().enumerate() {
            total += f.file_size;
            if total >= limit {
                inputs.truncate(i + 1);
                break;
            }
        }

        let mut c = Compaction::new(level, Arc::clone(&self.current));
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Merged iterator over every input of `c`
    pub fn make_input_iterator(&self, c: &Compaction) -> Result<Box<dyn InternalIterator>> {
        let level = c.level();
        let which_limit = if self.traits.overlapped(level + 1) { 1 } else { 2 };
        let mut list: Vec<Box<dyn InternalIterator>> = Vec::new();

        for which in 0..which_limit {
            let files = c.inputs(which);
            if files.is_empty() {
                continue;
            }

            if self.options.verify_compactions {
                for f in files {
                    self.table_cache.get(f.number, f.level)?.verify_checksum()?;
                }
            }

            if self.traits.overlapped(level + which) {
                for f in files {
                    list.push(self.table_cache.new_iterator(f.number, f.level)?);
                }
            } else {
                list.push(Box::new(LevelIterator::new(
                    self.icmp.clone(),
                    files.to_vec(),
                    Arc::clone(&self.table_cache),
                )));
            }
        }

        Ok(Box::new(MergingIterator::new(self.icmp.clone(), list)))
    }
}

fn max_option(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// =============================================================================
// Penalty Math
// =============================================================================

/// Raw write penalty for the shape of `v`, clamped to 0..=1000
///
/// Overlapped levels contribute once they pass the slowdown trigger; sorted
/// levels once they pass their maximum size. The first sorted level also
/// contributes when it is past its desired size while the level above it is
/// filling up.
pub fn compute_penalty(v: &Version, slowdown_trigger: usize, compaction_trigger: usize, write_buffer_size: u64) -> i32 {
    let traits = v.traits();
    let write_buffer_size = write_buffer_size.max(1);
    let mut penalty: i64 = 0;

    for level in 0..NUM_LEVELS - 1 {
        let mut value: i64 = 0;

        if traits.overlapped(level) {
            if slowdown_trigger < v.num_files(level) {
                value = if level == 0 { 2 } else { 1 };
            }
        } else {
            let level_bytes = v.level_bytes(level);
            let max_bytes = traits.max_bytes_for_level(level);
            let desired = traits.desired_bytes_for_level(level);

            if max_bytes != 0 && level_bytes / max_bytes > 0 {
                value = ((level_bytes - max_bytes) / write_buffer_size) as i64 + 1;
            } else if level == NUM_OVERLAP_LEVELS && desired < level_bytes {
                value = ((level_bytes - desired) / write_buffer_size) as i64;
                let count = v.num_files(level - 1) as i64 - (compaction_trigger / 2) as i64;
                if count < 0 {
                    value = 0;
                }
            }
        }

        penalty += value;
    }

    if !(0..=MAX_WRITE_PENALTY as i64).contains(&penalty) {
        MAX_WRITE_PENALTY
    } else {
        penalty as i32
    }
}

/// Move `prev` one step toward `target`: up by a seventh, down by a fifth,
/// never below zero
pub fn smooth_penalty(prev: i32, target: i32) -> i32 {
    let next = if prev < target {
        prev + (target - prev) / 7 + 1
    } else {
        prev - ((prev - target) / 5 + 1)
    };
    next.max(0)
}

// =============================================================================
// Builder
// =============================================================================

/// Accumulates edits on top of a base version without building the
/// intermediate versions
struct Builder<'a> {
    icmp: &'a InternalKeyComparator,
    base: Arc<Version>,
    deleted: [HashSet<u64>; NUM_LEVELS],
    added: [HashMap<u64, Arc<FileMetaData>>; NUM_LEVELS],
}

impl<'a> Builder<'a> {
    fn new(icmp: &'a InternalKeyComparator, base: Arc<Version>) -> Self {
        Self {
            icmp,
            base,
            deleted: Default::default(),
            added: Default::default(),
        }
    }

    fn apply(&mut self, edit: &VersionEdit, compact_pointer: &mut [Vec<u8>; NUM_LEVELS]) {
        for (level, key) in edit.compact_pointers() {
            compact_pointer[*level] = key.encode().to_vec();
        }

        for (level, number) in edit.deleted_files() {
            self.deleted[*level].insert(*number);
            self.added[*level].remove(number);
        }

        for (level, f) in edit.new_files() {
            let mut f = f.clone();
            f.level = *level;
            self.deleted[*level].remove(&f.number);
            self.added[*level].insert(f.number, Arc::new(f));
        }
    }

    /// Base files plus added files, minus deleted ones, each level ordered
    /// by smallest key then file number
    fn save_to(self, traits: Arc<LevelTraits>) -> Version {
        let mut v = Version::new(self.icmp.clone(), traits);
        let icmp = self.icmp;

        for level in 0..NUM_LEVELS {
            let deleted = &self.deleted[level];
            let mut files: Vec<Arc<FileMetaData>> = self
                .base
                .files(level)
                .iter()
                .filter(|f| !deleted.contains(&f.number) && !self.added[level].contains_key(&f.number))
                .cloned()
                .chain(self.added[level].values().cloned())
                .collect();

            files.sort_by(|a, b| {
                icmp.compare_keys(&a.smallest, &b.smallest)
                    .then_with(|| a.number.cmp(&b.number))
            });
            v.files[level] = files;
        }
        v
    }
}

// =============================================================================
// Manifest Reporter
// =============================================================================

/// Keeps the first corruption seen while reading the manifest
#[derive(Default)]
struct ManifestReporter {
    error: Option<StrataError>,
}

impl Reporter for ManifestReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        if self.error.is_none() {
            self.error = Some(StrataError::corruption(format!("{} ({} bytes dropped)", reason, bytes)));
        }
    }
}
