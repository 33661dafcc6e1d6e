//! Write Path
//!
//! Writers line up in a FIFO. The writer at the head commits its own batch
//! together with compatible batches queued behind it (group commit), so one
//! log append and one optional sync cover the whole group.
//!
//! ## Per group:
//! ```text
//! make room     rotate the memtable / wait on level-0 backpressure
//! sequence      assigned under the database mutex, in FIFO order
//! log + insert  with the mutex released
//! wake          every writer of the group gets the group's result
//! throttle      delay derived from the write penalty, outside the mutex
//! ```

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::WriteOptions;
use crate::error::{Result, StrataError};
use crate::filename::log_file_name;
use crate::memtable::MemTable;
use crate::scheduler::ImmWriteTask;
use crate::wal::LogWriter;
use crate::write_batch::WriteBatch;

use super::{DbInner, DbState, StateGuard};

/// Upper bound of a merged group
const MAX_GROUP_BYTES: usize = 1 << 20;

/// A small leading batch only drags this much extra along, so a tiny
/// write is not slowed down by a large group
const SMALL_BATCH_BYTES: usize = 128 << 10;

/// One queued write
pub(crate) struct Writer {
    /// `None` forces a memtable rotation without writing anything
    batch: Option<WriteBatch>,
    sync: bool,
    done: AtomicBool,
    result: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Self {
        Self {
            batch,
            sync,
            done: AtomicBool::new(false),
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Hand over the group's result; called by the group leader
    fn finish(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
        self.done.store(true, Ordering::Release);
        self.cv.notify_one();
    }

    fn take_result(&self) -> Result<()> {
        self.result.lock().take().unwrap_or(Ok(()))
    }
}

/// Merge the head batch with the batches queued behind it
///
/// Stops at the first writer without a batch, at a sync writer when the
/// head does not sync, or when the group would grow past its size cap.
/// Returns the merged batch and the last writer it covers.
fn build_batch_group(writers: &std::collections::VecDeque<Arc<Writer>>) -> Option<(WriteBatch, Arc<Writer>)> {
    let first = writers.front()?;
    let first_batch = first.batch.as_ref()?;

    let mut size = first_batch.byte_size();
    let max_size = if size <= SMALL_BATCH_BYTES {
        size + SMALL_BATCH_BYTES
    } else {
        MAX_GROUP_BYTES
    };

    let mut group = first_batch.clone();
    let mut last = Arc::clone(first);
    for writer in writers.iter().skip(1) {
        if writer.sync && !first.sync {
            break;
        }
        let Some(batch) = writer.batch.as_ref() else {
            break;
        };
        size += batch.byte_size();
        if size > max_size {
            break;
        }
        group.append(batch);
        last = Arc::clone(writer);
    }
    Some((group, last))
}

impl DbInner {
    /// Commit `batch`, or force a memtable rotation when it is `None`
    pub(crate) fn write(self: &Arc<Self>, options: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        let has_batch = batch.is_some();
        let batch_count = batch.as_ref().map_or(0, |b| b.count());
        let writer = Arc::new(Writer::new(batch, options.sync));

        let mut state = self.state.lock();
        state.writers.push_back(Arc::clone(&writer));
        while !writer.is_done() && !state.writers.front().map_or(false, |w| Arc::ptr_eq(w, &writer)) {
            writer.cv.wait(&mut state);
        }
        if writer.is_done() {
            return writer.take_result();
        }

        let mut result = self.make_room_for_write(&mut state, !has_batch);
        let mut last_writer = Arc::clone(&writer);

        if result.is_ok() && has_batch {
            if let Some((mut group, group_last)) = build_batch_group(&state.writers) {
                last_writer = group_last;

                let mut last_sequence = state.versions.last_sequence();
                group.set_sequence(last_sequence + 1);
                last_sequence += u64::from(group.count());

                // Only the head writer touches the log and the active
                // memtable, so both can be used without the mutex.
                let mem = Arc::clone(&state.mem);
                let mut log = state.log.take();
                let sync = writer.sync;
                let expiry = self.options.expiry.clone();
                result = MutexGuard::unlocked(&mut state, || -> Result<()> {
                    let log = log
                        .as_mut()
                        .ok_or_else(|| StrataError::io("write-ahead log is not open"))?;
                    log.add_record(group.contents())?;
                    if sync {
                        log.sync()?;
                    }
                    group.insert_into(&mem, expiry.as_deref())
                });
                state.log = log;
                state.versions.set_last_sequence(last_sequence);
            }
        }

        while let Some(ready) = state.writers.pop_front() {
            let is_last = Arc::ptr_eq(&ready, &last_writer);
            if !Arc::ptr_eq(&ready, &writer) {
                ready.finish(result.clone());
            }
            if is_last {
                break;
            }
        }
        if let Some(front) = state.writers.front() {
            front.cv.notify_one();
        }

        let throttle = self.context.throttle();
        let delay = state
            .versions
            .write_throttle_usec(throttle.rate(), throttle.unadjusted_rate());
        drop(state);

        self.apply_throttle(delay, has_batch, batch_count);
        result
    }

    /// Sleep the per-key write delay, serialized across writers so the
    /// delays add up to one global schedule
    fn apply_throttle(&self, throttle: u64, has_batch: bool, batch_count: u32) {
        let mut throttle_end = self.throttle_end.lock();
        if throttle == 0 {
            *throttle_end = 0;
            return;
        }

        let now = self.env.now_micros();
        let mut remaining = 0;
        let mut new_end = now + throttle;
        if now < *throttle_end {
            remaining = *throttle_end - now;
            self.env.sleep_for_micros(remaining);
            new_end = now + remaining + throttle;
        }

        // The first key of a batch is covered above, the rest pay here
        let keys = if !self.options.is_internal_db && has_batch {
            u64::from(batch_count)
        } else {
            1
        };
        let batch_wait = throttle * keys.saturating_sub(1);
        if now + remaining < *throttle_end + batch_wait {
            let extra = *throttle_end + batch_wait - (now + remaining);
            self.env.sleep_for_micros(extra);
            new_end += extra;
        }

        *throttle_end = new_end;
    }

    /// Make sure the active memtable can take the next write
    ///
    /// With `force` the memtable is rotated even if it has room. May wait on
    /// the background condvar for a flush or for level 0 to drain.
    pub(super) fn make_room_for_write(self: &Arc<Self>, state: &mut StateGuard<'_>, mut force: bool) -> Result<()> {
        let mut allow_delay = !force;

        loop {
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }

            if allow_delay && state.versions.num_level_files(0) >= self.options.l0_slowdown_writes_trigger {
                // The write throttle supplies the delay; only check once per write.
                allow_delay = false;
                debug!(level0_files = state.versions.num_level_files(0), "Level-0 slowdown reached");
                continue;
            }

            if !force && state.mem.approximate_memory_usage() <= self.options.write_buffer_size {
                break;
            }

            if state.imm.is_some() {
                // The previous memtable is still being flushed
                self.maybe_schedule_compaction(state);
                if self.is_shutting_down() {
                    return Err(StrataError::io("database is closing"));
                }
                self.bg_cv.wait(state);
                continue;
            }

            if state.versions.num_level_files(0) >= self.options.l0_stop_writes_trigger {
                info!(level0_files = state.versions.num_level_files(0), "Too many level-0 files; waiting");
                self.maybe_schedule_compaction(state);
                if self.is_shutting_down() {
                    return Err(StrataError::io("database is closing"));
                }
                self.bg_cv.wait(state);
                continue;
            }

            // Switch to a new memtable and log file
            let number = state.versions.new_file_number();
            if let Err(e) = self.open_log_file(state, number) {
                state.versions.reuse_file_number(number);
                return Err(e);
            }
            let fresh = Arc::new(MemTable::new(self.icmp.clone()));
            let full = mem::replace(&mut state.mem, fresh);
            debug!(
                log_number = number,
                entries = full.num_entries(),
                bytes = full.approximate_memory_usage(),
                "Memtable rotated"
            );
            state.imm = Some(full);
            self.context
                .imm_pool()
                .submit(Box::new(ImmWriteTask::new(Arc::clone(self))), true);
            force = false;
            self.maybe_schedule_compaction(state);
        }

        Ok(())
    }

    /// Start a new log file and make it the target of future writes
    pub(super) fn open_log_file(&self, state: &mut DbState, number: u64) -> Result<()> {
        let file = self.env.new_writable_file(&log_file_name(&self.dbname, number))?;
        state.log = Some(LogWriter::new(file));
        state.logfile_number = number;
        Ok(())
    }
}
