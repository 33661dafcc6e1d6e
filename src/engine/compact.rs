//! Background Work
//!
//! Memtable flushes, merging compactions, whole-file expiry, manual
//! compactions and obsolete-file cleanup.
//!
//! All of it runs under the database mutex except table building and the
//! merge loop itself, which release it. A background failure is logged,
//! the worker backs off for a second, and the work is picked again later;
//! only with `paranoid_checks` does the error stick and fail later writes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

use crate::config::{Options, NUM_LEVELS};
use crate::env::Env;
use crate::error::{Result, StrataError, SHUTDOWN_COMPACTION, SHUTDOWN_EXPIRY, SHUTDOWN_MEMTABLE};
use crate::filename::{parse_file_name, table_dir_name, table_file_name, FileType};
use crate::iterator::InternalIterator;
use crate::key::{InternalKey, KeyRetirement, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK};
use crate::memtable::MemTable;
use crate::scheduler::{CompactionTask, ImmWriteTask};
use crate::storage::{SSTableBuilder, TableCache, TableInfo};
use crate::version::{Compaction, CompactionKind, FileMetaData, Version, VersionEdit, VersionSet};

use super::{DbInner, DbState, StateGuard};

/// Pause after a failed background job before the worker moves on
const BACKGROUND_ERROR_BACKOFF_MICROS: u64 = 1_000_000;

/// Compaction requested through `compact_range` / `test_compact_range`
#[derive(Debug)]
pub(super) struct ManualCompaction {
    pub level: usize,
    pub begin: Option<InternalKey>,
    pub end: Option<InternalKey>,
    pub done: bool,
}

/// Per-level totals reported by the `stats` property
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CompactionStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl CompactionStats {
    pub fn add(&mut self, micros: u64, bytes_read: u64, bytes_written: u64) {
        self.micros += micros;
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

// =============================================================================
// Table Building
// =============================================================================

struct BuildOutcome {
    meta: Option<FileMetaData>,
    keys_seen: u64,
    keys_retired: u64,
}

fn file_meta_from(number: u64, level: usize, info: TableInfo) -> FileMetaData {
    let mut meta = FileMetaData::new(number, level, info.file_size, info.smallest, info.largest);
    meta.num_entries = info.entry_count;
    meta.exp_write_low = info.counters.exp_write_low;
    meta.exp_write_high = info.counters.exp_write_high;
    meta.exp_explicit_high = info.counters.exp_explicit_high;
    meta
}

/// Copy `iter` into level-0 table `number`, leaving out shadowed records
fn build_table(
    dbname: &Path,
    env: &Arc<dyn Env>,
    options: &Options,
    table_cache: &TableCache,
    iter: &mut dyn InternalIterator,
    number: u64,
    smallest_snapshot: SequenceNumber,
) -> Result<BuildOutcome> {
    let mut outcome = BuildOutcome {
        meta: None,
        keys_seen: 0,
        keys_retired: 0,
    };

    iter.seek_to_first()?;
    if !iter.is_valid() {
        return Ok(outcome);
    }

    let path = table_file_name(dbname, number, 0);
    let mut builder = SSTableBuilder::new(Arc::clone(env), &path, options.expiry.clone())?;
    let mut retirement = KeyRetirement::new(Arc::clone(&options.comparator), smallest_snapshot, options.expiry.clone());

    let copied = (|| -> Result<()> {
        while iter.is_valid() {
            outcome.keys_seen += 1;
            if retirement.retire(iter.key(), None) {
                outcome.keys_retired += 1;
            } else {
                builder.add(iter.key(), iter.value())?;
            }
            iter.next()?;
        }
        Ok(())
    })();

    if let Err(e) = copied {
        let _ = builder.abandon();
        return Err(e);
    }
    if builder.num_entries() == 0 {
        let _ = builder.abandon();
        return Ok(outcome);
    }

    let info = match builder.finish() {
        Ok(info) => info,
        Err(e) => {
            let _ = env.remove_file(&path);
            return Err(e);
        }
    };

    // Make sure what was written can be read back
    if let Err(e) = table_cache.get(number, 0) {
        table_cache.evict(number);
        let _ = env.remove_file(&path);
        return Err(e);
    }

    outcome.meta = Some(file_meta_from(number, 0, info));
    Ok(outcome)
}

// =============================================================================
// Compaction Outputs
// =============================================================================

/// Output side of one running compaction
struct CompactionOutputs {
    target_level: usize,
    files: Vec<FileMetaData>,
    builder: Option<(u64, SSTableBuilder)>,
    total_bytes: u64,
    num_entries: u64,
}

impl CompactionOutputs {
    fn new(target_level: usize) -> Self {
        Self {
            target_level,
            files: Vec::new(),
            builder: None,
            total_bytes: 0,
            num_entries: 0,
        }
    }

    /// Drop an unfinished output file and return its number
    fn abandon(&mut self) -> Option<u64> {
        let (number, builder) = self.builder.take()?;
        if let Err(e) = builder.abandon() {
            warn!(file_number = number, error = %e, "Could not remove abandoned compaction output");
        }
        Some(number)
    }
}

impl DbInner {
    // =========================================================================
    // Scheduling
    // =========================================================================

    /// True while a flush or any compaction is submitted
    pub(super) fn is_compaction_scheduled_locked(&self, state: &DbState) -> bool {
        state.imm.is_some() || (0..NUM_LEVELS).any(|level| state.versions.is_compaction_submitted(level))
    }

    /// Submit whatever compactions the current version needs, or the
    /// pending manual compaction
    pub(super) fn maybe_schedule_compaction(self: &Arc<Self>, state: &mut DbState) {
        if self.is_shutting_down() {
            return;
        }

        let Some(level) = state.manual.as_ref().map(|m| m.level) else {
            let user_dbs = self.context.user_db_count();
            let context = &self.context;
            state.versions.pick_compaction(user_dbs, &mut |c: Compaction, ok_to_queue: bool| {
                let level0 = c.level() == 0;
                debug!(level = c.level(), kind = ?c.kind(), ok_to_queue, "Submitting compaction");
                context.submit_compaction(Box::new(CompactionTask::new(Arc::clone(self), c)), level0, ok_to_queue)
            });
            return;
        };

        if state.versions.is_compaction_submitted(level) {
            return;
        }
        if self
            .context
            .compaction_pool()
            .submit(Box::new(CompactionTask::manual(Arc::clone(self))), true)
        {
            state.versions.set_compaction_submitted(level);
        } else {
            warn!(level, "Manual compaction rejected by the compaction pool");
            self.finish_manual(state, None, true);
        }
    }

    /// Hand the manual compaction back to its waiter
    fn finish_manual(&self, state: &mut DbState, resume_at: Option<InternalKey>, done: bool) {
        if let Some(mut manual) = state.manual.take() {
            manual.done |= done;
            if !manual.done {
                manual.begin = resume_at;
            }
            state.manual_result = Some(manual);
        }
        self.bg_cv.notify_all();
    }

    /// Pause a worker after a failure, with the mutex released
    fn back_off(&self, state: &mut StateGuard<'_>, what: &str, err: &StrataError) {
        self.bg_cv.notify_all();
        MutexGuard::unlocked(state, || {
            warn!(error = %err, "Waiting after background {} error", what);
            self.env.sleep_for_micros(BACKGROUND_ERROR_BACKOFF_MICROS);
        });
    }

    // =========================================================================
    // Memtable Flush
    // =========================================================================

    /// Entry point of [`ImmWriteTask`]
    pub(crate) fn background_imm_compact_call(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.running_compactions += 1;

        let mut result = Ok(());
        if !self.is_shutting_down() {
            result = self.compact_memtable(&mut state);
            if let Err(e) = &result {
                if !self.is_shutting_down() {
                    let e = e.clone();
                    self.back_off(&mut state, "memtable flush", &e);
                }
            }
        }

        state.running_compactions -= 1;
        self.maybe_schedule_compaction(&mut state);

        if self.is_shutting_down() {
            // Still in the log; replayed on the next open
            state.imm = None;
        } else if result.is_err() {
            self.context
                .imm_pool()
                .submit(Box::new(ImmWriteTask::new(Arc::clone(self))), true);
        }
        self.bg_cv.notify_all();
    }

    /// Flush the immutable memtable and retire the log files it covered
    pub(super) fn compact_memtable(&self, state: &mut StateGuard<'_>) -> Result<()> {
        let Some(imm) = state.imm.clone() else {
            return Ok(());
        };

        let mut edit = VersionEdit::new();
        let base = state.versions.current();
        self.write_level0_table(state, &imm, &mut edit, Some(&base))?;
        drop(base);

        if self.is_shutting_down() {
            return Err(StrataError::io(SHUTDOWN_MEMTABLE));
        }

        edit.set_prev_log_number(0);
        edit.set_log_number(state.logfile_number);
        VersionSet::log_and_apply(state, &mut edit)?;

        state.imm = None;
        self.delete_obsolete_files(state);
        Ok(())
    }

    /// Build a table from `mem` and record it in `edit`
    ///
    /// With a `base` version the table may be pushed below level 0 when it
    /// overlaps nothing there and the target level is not being compacted.
    pub(super) fn write_level0_table(
        &self,
        state: &mut StateGuard<'_>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Arc<Version>>,
    ) -> Result<()> {
        let start = self.env.now_micros();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        let smallest_snapshot = self.smallest_snapshot(state);
        info!(file_number = number, entries = mem.num_entries(), "Level-0 table started");

        let mut iter = mem.iter();
        let built = MutexGuard::unlocked(state, || {
            build_table(
                &self.dbname,
                &self.env,
                &self.options,
                &self.table_cache,
                &mut iter,
                number,
                smallest_snapshot,
            )
        });
        state.pending_outputs.remove(&number);
        let outcome = built?;

        let mut level = 0;
        let mut bytes = 0;
        if let Some(meta) = outcome.meta {
            bytes = meta.file_size;
            info!(
                file_number = number,
                bytes,
                keys = outcome.keys_seen,
                retired = outcome.keys_retired,
                "Level-0 table #{}: {} bytes, {} keys",
                number,
                bytes,
                outcome.keys_seen
            );

            if let Some(base) = base {
                level = base.pick_level_for_memtable_output(
                    meta.smallest.user_key(),
                    meta.largest.user_key(),
                    self.options.max_mem_compact_level,
                );
                if level != 0
                    && (state.versions.is_compaction_submitted(level) || !state.versions.neighbor_compactions_quiet(level))
                {
                    level = 0;
                }

                if level != 0 {
                    let from = table_file_name(&self.dbname, number, 0);
                    let to = table_file_name(&self.dbname, number, level);
                    match self.env.rename_file(&from, &to) {
                        Ok(()) => {
                            self.table_cache.evict(number);
                            info!(file_number = number, level, "Level-0 table #{} moved to level {}", number, level);
                        }
                        Err(e) => {
                            warn!(file_number = number, level, error = %e, "Level-0 table move failed");
                            level = 0;
                        }
                    }
                }
            }

            edit.add_file(level, meta);
        }

        state.stats[level].add(self.env.now_micros().saturating_sub(start), 0, bytes);
        Ok(())
    }

    // =========================================================================
    // Compactions
    // =========================================================================

    /// Entry point of [`CompactionTask`]; `None` runs the manual compaction
    pub(crate) fn background_call(self: &Arc<Self>, compaction: Option<Compaction>) {
        let mut state = self.state.lock();
        state.running_compactions += 1;

        let level = match &compaction {
            Some(c) => c.level(),
            None => state.manual.as_ref().map_or(0, |m| m.level),
        };
        state.versions.set_compaction_running(level);

        if self.is_shutting_down() {
            if compaction.is_none() {
                self.finish_manual(&mut state, None, true);
            }
        } else {
            let result = match compaction {
                Some(c) if c.kind() == CompactionKind::ExpiryFile => self.background_expiry(&mut state, c),
                other => self.background_compaction(&mut state, other),
            };
            if let Err(e) = result {
                if !self.is_shutting_down() {
                    self.back_off(&mut state, "compaction", &e);
                }
            }
        }

        state.running_compactions -= 1;
        state.versions.set_compaction_done(level, self.env.now_micros());
        self.maybe_schedule_compaction(&mut state);
        self.bg_cv.notify_all();
    }

    fn background_compaction(&self, state: &mut StateGuard<'_>, compaction: Option<Compaction>) -> Result<()> {
        let is_manual = compaction.is_none();
        let mut manual_end = None;

        let compaction = match compaction {
            Some(c) => Some(c),
            None => {
                let Some((level, begin, end)) = state.manual.as_ref().map(|m| (m.level, m.begin.clone(), m.end.clone()))
                else {
                    return Ok(());
                };
                let c = state.versions.compact_range(level, begin.as_ref(), end.as_ref());
                if let Some(m) = state.manual.as_mut() {
                    m.done = c.is_none();
                }
                if let Some(c) = &c {
                    manual_end = c.inputs(0).last().map(|f| f.largest.clone());
                }
                info!(
                    level,
                    begin = ?begin,
                    end = ?end,
                    done = c.is_none(),
                    "Manual compaction at level-{}",
                    level
                );
                c
            }
        };

        let mut result = Ok(());
        if let Some(mut c) = compaction {
            let mut merge = true;

            if !is_manual && c.is_trivial_move() {
                match self.move_file_down(state, &mut c) {
                    Ok(moved) => {
                        merge = !moved;
                    }
                    Err(e) => {
                        result = Err(e);
                        merge = false;
                    }
                }
            }

            if merge {
                result = self.do_compaction_work(state, &mut c);
                self.delete_obsolete_files(state);
            }
        }

        if let Err(e) = &result {
            if !self.is_shutting_down() && !e.is_shutdown_abort() {
                error!(error = %e, "Compaction error");
                if self.options.paranoid_checks && state.bg_error.is_none() {
                    state.bg_error = Some(e.clone());
                }
            }
        }

        if is_manual {
            self.finish_manual(state, manual_end, result.is_err());
        }
        result
    }

    /// Rename the single input of a trivial move into the next level.
    /// Returns false when the rename failed and a real merge is needed.
    fn move_file_down(&self, state: &mut StateGuard<'_>, c: &mut Compaction) -> Result<bool> {
        let level = c.level();
        let Some(f) = c.inputs(0).first().cloned() else {
            return Ok(true);
        };

        let from = table_file_name(&self.dbname, f.number, level);
        let to = table_file_name(&self.dbname, f.number, level + 1);
        if let Err(e) = self.env.rename_file(&from, &to) {
            warn!(file_number = f.number, level, error = %e, "Table move failed; compacting instead");
            return Ok(false);
        }
        self.table_cache.evict(f.number);

        let mut edit = std::mem::take(c.edit_mut());
        edit.delete_file(level, f.number);
        edit.add_file(level + 1, FileMetaData::clone(&f));
        if let Err(e) = VersionSet::log_and_apply(state, &mut edit) {
            let _ = self.env.rename_file(&to, &from);
            return Err(e);
        }
        self.delete_obsolete_files(state);

        info!(
            file_number = f.number,
            level = level + 1,
            bytes = f.file_size,
            "Moved #{} to level-{} {} bytes: {}",
            f.number,
            level + 1,
            f.file_size,
            state.versions.level_summary()
        );
        self.context.throttle().record_compaction(0, 0, level == 0);
        Ok(true)
    }

    /// Merge the inputs of `c` into new tables at the next level
    fn do_compaction_work(&self, state: &mut StateGuard<'_>, c: &mut Compaction) -> Result<()> {
        let start = self.env.now_micros();
        let level = c.level();
        info!(
            level,
            inputs0 = c.num_input_files(0),
            inputs1 = c.num_input_files(1),
            "Compacting {}@{} + {}@{} files",
            c.num_input_files(0),
            level,
            c.num_input_files(1),
            level + 1
        );

        let smallest_snapshot = self.smallest_snapshot(state);
        let mut outputs = CompactionOutputs::new(level + 1);
        let mut input = state.versions.make_input_iterator(c)?;

        let merged = MutexGuard::unlocked(state, || self.run_merge(c, &mut *input, smallest_snapshot, &mut outputs));
        drop(input);

        let bytes_read: u64 = (0..2).flat_map(|which| c.inputs(which).iter()).map(|f| f.file_size).sum();
        let elapsed = self.env.now_micros().saturating_sub(start);
        state.stats[level + 1].add(elapsed, bytes_read, outputs.total_bytes);

        let result = merged.and_then(|()| {
            if outputs.num_entries != 0 {
                self.context
                    .throttle()
                    .record_compaction(elapsed, outputs.num_entries, level == 0);
            }
            self.install_compaction_results(state, c, &outputs)
        });

        if let Some(number) = outputs.abandon() {
            state.pending_outputs.remove(&number);
        }
        for f in &outputs.files {
            state.pending_outputs.remove(&f.number);
        }
        debug!(summary = %state.versions.level_summary(), "Compacted to");
        result
    }

    /// The merge loop; runs without the database mutex
    fn run_merge(
        &self,
        c: &mut Compaction,
        input: &mut dyn InternalIterator,
        smallest_snapshot: SequenceNumber,
        outputs: &mut CompactionOutputs,
    ) -> Result<()> {
        let mut retirement = KeyRetirement::new(
            Arc::clone(&self.options.comparator),
            smallest_snapshot,
            self.options.expiry.clone(),
        );

        input.seek_to_first()?;
        while input.is_valid() && !self.is_shutting_down() {
            let key = input.key();

            let stop = outputs
                .builder
                .as_ref()
                .map_or(false, |(_, builder)| c.should_stop_before(key, builder.num_entries()));
            if stop {
                self.finish_output(outputs)?;
            }

            if !retirement.retire(key, Some(&mut *c)) {
                if outputs.builder.is_none() {
                    self.open_output(outputs)?;
                }
                if let Some((_, builder)) = outputs.builder.as_mut() {
                    builder.add(key, input.value())?;
                    if builder.file_size() >= c.max_output_file_size() {
                        self.finish_output(outputs)?;
                    }
                }
            }

            input.next()?;
        }

        if self.is_shutting_down() {
            return Err(StrataError::io(SHUTDOWN_COMPACTION));
        }
        if outputs.builder.is_some() {
            self.finish_output(outputs)?;
        }

        debug!(
            dropped = retirement.dropped,
            expired = retirement.expired,
            "Compaction retired keys"
        );
        Ok(())
    }

    fn open_output(&self, outputs: &mut CompactionOutputs) -> Result<()> {
        let number = {
            let mut state = self.state.lock();
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };

        let path = table_file_name(&self.dbname, number, outputs.target_level);
        match SSTableBuilder::new(Arc::clone(&self.env), &path, self.options.expiry.clone()) {
            Ok(builder) => {
                outputs.builder = Some((number, builder));
                Ok(())
            }
            Err(e) => {
                self.state.lock().pending_outputs.remove(&number);
                Err(e)
            }
        }
    }

    fn finish_output(&self, outputs: &mut CompactionOutputs) -> Result<()> {
        let Some((number, builder)) = outputs.builder.take() else {
            return Ok(());
        };
        let info = builder.finish()?;
        let meta = file_meta_from(number, outputs.target_level, info);

        // Newly written tables must open cleanly before they are installed
        let table = self.table_cache.get(number, outputs.target_level)?;
        if self.options.verify_compactions {
            table.verify_checksum()?;
        }

        debug!(
            file_number = number,
            level = outputs.target_level,
            keys = meta.num_entries,
            bytes = meta.file_size,
            "Generated table #{}: {} keys, {} bytes",
            number,
            meta.num_entries,
            meta.file_size
        );
        outputs.total_bytes += meta.file_size;
        outputs.num_entries += meta.num_entries;
        outputs.files.push(meta);
        Ok(())
    }

    fn install_compaction_results(
        &self,
        state: &mut StateGuard<'_>,
        c: &mut Compaction,
        outputs: &CompactionOutputs,
    ) -> Result<()> {
        let level = c.level();
        info!(
            level,
            bytes = outputs.total_bytes,
            "Compacted {}@{} + {}@{} files => {} bytes",
            c.num_input_files(0),
            level,
            c.num_input_files(1),
            level + 1,
            outputs.total_bytes
        );

        let mut edit = std::mem::take(c.edit_mut());
        c.add_input_deletions(&mut edit);
        for f in &outputs.files {
            edit.add_file(level + 1, f.clone());
        }
        VersionSet::log_and_apply(state, &mut edit)
    }

    // =========================================================================
    // Whole-file Expiry
    // =========================================================================

    fn background_expiry(&self, state: &mut StateGuard<'_>, c: Compaction) -> Result<()> {
        let Some(policy) = self.options.expiry.clone().filter(|p| p.expiry_activated()) else {
            return Ok(());
        };

        let level = c.level();
        let mut edit = VersionEdit::new();
        policy.compaction_finalize_callback(true, c.input_version(), level, Some(&mut edit));
        let count = edit.deleted_file_count();

        if self.is_shutting_down() {
            return Err(StrataError::io(SHUTDOWN_EXPIRY));
        }
        if count == 0 {
            return Ok(());
        }

        VersionSet::log_and_apply(state, &mut edit)
            .map_err(|e| StrataError::io(format!("LogAndApply error during expiry compaction: {}", e)))?;
        drop(c);
        self.delete_obsolete_files(state);
        info!(level, files = count, "Expired: {} files from level {}", count, level);
        Ok(())
    }

    // =========================================================================
    // Obsolete Files
    // =========================================================================

    /// Delete every file no live version, pending output or current log
    /// still needs. Skipped while another compaction is running.
    pub(super) fn delete_obsolete_files(&self, state: &mut DbState) {
        if state.running_compactions >= 2 {
            return;
        }

        let mut live: HashSet<u64> = state.pending_outputs.clone();
        live.extend(state.versions.live_files());
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let keep = |number: u64, file_type: FileType| match file_type {
            FileType::Log => number >= log_number || number == prev_log_number,
            FileType::Descriptor => number >= manifest_number,
            FileType::Table | FileType::Temp => live.contains(&number),
            FileType::Current | FileType::DbLock | FileType::InfoLog => true,
        };

        if let Ok(children) = self.env.get_children(&self.dbname) {
            for name in children {
                let Some((number, file_type)) = parse_file_name(&name) else {
                    continue;
                };
                if keep(number, file_type) {
                    continue;
                }
                debug!(file = %name, "Delete obsolete file");
                if let Err(e) = self.env.remove_file(&self.dbname.join(&name)) {
                    warn!(file = %name, error = %e, "Could not delete obsolete file");
                }
            }
        }

        for level in 0..NUM_LEVELS {
            let dir = table_dir_name(&self.dbname, level);
            let Ok(children) = self.env.get_children(&dir) else {
                continue;
            };
            for name in children {
                let Some((number, file_type)) = parse_file_name(&name) else {
                    continue;
                };
                if file_type != FileType::Table || keep(number, file_type) {
                    continue;
                }
                self.table_cache.evict(number);
                debug!(file = %name, level, "Delete obsolete table");
                if let Err(e) = self.env.remove_file(&dir.join(&name)) {
                    warn!(file = %name, level, error = %e, "Could not delete obsolete table");
                }
            }
        }
    }

    // =========================================================================
    // Manual Compaction
    // =========================================================================

    /// Compact every level holding keys of `[begin, end]`, memtable first
    pub(super) fn compact_range(self: &Arc<Self>, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let max_level_with_files = {
            let state = self.state.lock();
            let current = state.versions.current();
            (1..NUM_LEVELS)
                .filter(|&level| current.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };

        self.compact_memtable_synchronous()?;
        for level in 0..max_level_with_files {
            self.test_compact_range(level, begin, end)?;
        }
        Ok(())
    }

    /// Run the manual compaction of `level` over `[begin, end]` until the
    /// whole range has been pushed to `level + 1`
    pub(super) fn test_compact_range(self: &Arc<Self>, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        if level + 1 >= NUM_LEVELS {
            return Err(StrataError::invalid_argument(format!("no level below level-{}", level)));
        }

        let mut manual = ManualCompaction {
            level,
            begin: begin.map(|k| InternalKey::new(k, 0, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)),
            end: end.map(|k| InternalKey::new(k, 0, 0, ValueType::Deletion)),
            done: false,
        };

        let mut state = self.state.lock();
        while !manual.done {
            while state.manual.is_some() || self.is_compaction_scheduled_locked(&state) {
                if let Some(e) = &state.bg_error {
                    return Err(e.clone());
                }
                self.bg_cv.wait(&mut state);
            }

            state.manual = Some(manual);
            self.maybe_schedule_compaction(&mut state);

            manual = loop {
                if let Some(result) = state.manual_result.take() {
                    break result;
                }
                self.bg_cv.wait(&mut state);
            };
        }

        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Rotate the memtable and wait for its flush
    pub(super) fn compact_memtable_synchronous(self: &Arc<Self>) -> Result<()> {
        self.write(&Default::default(), None)?;

        let mut state = self.state.lock();
        while state.imm.is_some() && state.bg_error.is_none() {
            self.bg_cv.wait(&mut state);
        }
        match &state.bg_error {
            Some(e) if state.imm.is_some() => Err(e.clone()),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Open-time Cleanup
    // =========================================================================

    /// Hold `open` until overlapped levels are back under the slowdown
    /// trigger, e.g. after replaying a large log
    pub(super) fn check_compaction_state(self: &Arc<Self>, state: &mut StateGuard<'_>) {
        let mut logged = false;

        loop {
            if self.is_compaction_scheduled_locked(state) {
                self.bg_cv.wait(state);
            }

            let mut need_compaction = false;
            for level in 0..NUM_LEVELS {
                if state.versions.traits().overlapped(level)
                    && state.versions.num_level_files(level) >= self.options.l0_slowdown_writes_trigger
                {
                    need_compaction = true;
                    self.maybe_schedule_compaction(state);
                    if !logged {
                        info!("Cleanup compactions started ... DB::Open paused");
                        logged = true;
                    }
                    break;
                }
            }

            if !(need_compaction && self.is_compaction_scheduled_locked(state)) {
                break;
            }
        }

        if logged {
            info!("Cleanup compactions completed ... DB::Open continuing");
        } else {
            // Nothing urgent, but let the usual rules run
            self.maybe_schedule_compaction(state);
        }
    }

    pub(super) fn smallest_snapshot(&self, state: &mut DbState) -> SequenceNumber {
        state
            .snapshots
            .oldest()
            .unwrap_or_else(|| state.versions.last_sequence())
    }
}
