//! Engine Module
//!
//! The database orchestrator: ties the write-ahead log, memtables, version
//! set and background runtime together behind [`Engine`].
//!
//! ## Concurrency Model
//!
//! - **One database mutex** (`DbInner::state`) guards the current version,
//!   the memtable pair, the writer queue, pending outputs and compaction
//!   bookkeeping
//! - **Manifest writes** happen under the version set's own manifest mutex
//!   with the database mutex released
//! - **Table building, merging and log appends** run unlocked
//! - **Write throttle delay** is serialized by `throttle_end`, outside the
//!   database mutex
//!
//! ## Lock Order
//! ```text
//! state -> manifest
//! throttle_end (never held with state)
//! ```
//!
//! Background tasks hold an `Arc<DbInner>`. Closing the engine raises the
//! shutdown flag and waits until no flush or compaction is scheduled, so
//! nothing outlives the handle by more than the tail of a task.

mod compact;
mod iter;
mod properties;
mod recovery;
mod snapshot;
mod write;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::{Options, ReadOptions, WriteOptions, NUM_LEVELS};
use crate::context::DbContext;
use crate::env::{Env, FileLock};
use crate::error::{Result, StrataError};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::key::{ExpiryTime, InternalKey, InternalKeyComparator, LookupKey, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK};
use crate::memtable::{MemGet, MemTable};
use crate::storage::TableCache;
use crate::version::VersionSet;
use crate::wal::LogWriter;
use crate::write_batch::WriteBatch;

use compact::{CompactionStats, ManualCompaction};
use snapshot::SnapshotList;

pub use iter::DbIterator;
pub use recovery::destroy_db;
pub use snapshot::Snapshot;

/// Smallest memtable size accepted at open
const MIN_WRITE_BUFFER_SIZE: usize = 64 << 10;

type StateGuard<'a> = MutexGuard<'a, DbState>;

// =============================================================================
// Shared State
// =============================================================================

/// Everything guarded by the database mutex
pub(crate) struct DbState {
    versions: VersionSet,

    /// Active memtable, written by the head writer
    mem: Arc<MemTable>,

    /// Full memtable waiting for its level-0 flush
    imm: Option<Arc<MemTable>>,

    /// Current log segment; taken by the head writer while it appends
    log: Option<LogWriter>,
    logfile_number: u64,

    /// Queued writers, head first
    writers: VecDeque<Arc<write::Writer>>,

    /// Table numbers being written by flushes and compactions
    pending_outputs: HashSet<u64>,

    snapshots: SnapshotList,

    /// Sticky background error (paranoid mode)
    bg_error: Option<StrataError>,

    /// Manual compaction waiting to run, and the one handed back
    manual: Option<ManualCompaction>,
    manual_result: Option<ManualCompaction>,

    running_compactions: usize,
    stats: [CompactionStats; NUM_LEVELS],
}

impl AsMut<VersionSet> for DbState {
    fn as_mut(&mut self) -> &mut VersionSet {
        &mut self.versions
    }
}

/// The database shared between the handle and background tasks
pub(crate) struct DbInner {
    dbname: PathBuf,
    options: Arc<Options>,
    env: Arc<dyn Env>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    context: Arc<DbContext>,

    state: Mutex<DbState>,

    /// Signalled whenever background work finishes
    bg_cv: Condvar,

    shutting_down: AtomicBool,

    /// End of the current write-throttle schedule, in env micros
    throttle_end: Mutex<u64>,

    db_lock: Mutex<Option<FileLock>>,
    registry_id: AtomicU64,
}

impl DbInner {
    fn new(dbname: PathBuf, options: Arc<Options>, context: Arc<DbContext>) -> Self {
        let env = Arc::clone(&options.env);
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let table_cache = Arc::new(TableCache::new(&dbname, Arc::clone(&env), icmp.clone()));
        let versions = VersionSet::new(&dbname, Arc::clone(&options), Arc::clone(&table_cache), icmp.clone());

        let state = DbState {
            versions,
            mem: Arc::new(MemTable::new(icmp.clone())),
            imm: None,
            log: None,
            logfile_number: 0,
            writers: VecDeque::new(),
            pending_outputs: HashSet::new(),
            snapshots: SnapshotList::default(),
            bg_error: None,
            manual: None,
            manual_result: None,
            running_compactions: 0,
            stats: [CompactionStats::default(); NUM_LEVELS],
        };

        Self {
            dbname,
            options,
            env,
            icmp,
            table_cache,
            context,
            state: Mutex::new(state),
            bg_cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            throttle_end: Mutex::new(0),
            db_lock: Mutex::new(None),
            registry_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn context(&self) -> &Arc<DbContext> {
        &self.context
    }

    /// Called by grooming polls when compaction threads are idle
    pub(crate) fn check_available_compactions(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !self.is_shutting_down() && state.imm.is_none() {
            self.maybe_schedule_compaction(&mut state);
        }
    }

    fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (sequence, mem, imm, current) = {
            let state = self.state.lock();
            let sequence = match &options.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (sequence, Arc::clone(&state.mem), state.imm.clone(), state.versions.current())
        };

        let lookup = LookupKey::new(key, sequence);
        let expiry = self.options.expiry.as_deref();

        for table in std::iter::once(&mem).chain(imm.as_ref()) {
            match table.get(&lookup, expiry) {
                MemGet::Found(value) => return Ok(Some(value)),
                MemGet::Deleted => return Ok(None),
                MemGet::NotFound => {}
            }
        }

        current.get(&lookup, &self.table_cache, expiry)
    }

    fn new_iterator(&self, options: &ReadOptions) -> Result<DbIterator> {
        let (sequence, mem, imm, current) = {
            let state = self.state.lock();
            let sequence = match &options.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (sequence, Arc::clone(&state.mem), state.imm.clone(), state.versions.current())
        };

        if options.verify_checksums {
            for level in 0..NUM_LEVELS {
                for file in current.files(level) {
                    self.table_cache.get(file.number, file.level)?.verify_checksum()?;
                }
            }
        }

        let mut children: Vec<Box<dyn InternalIterator>> = vec![Box::new(mem.iter())];
        if let Some(imm) = &imm {
            children.push(Box::new(imm.iter()));
        }
        current.add_iterators(&self.table_cache, &mut children)?;

        Ok(DbIterator::new(
            Box::new(MergingIterator::new(self.icmp.clone(), children)),
            Arc::clone(self.icmp.user_comparator()),
            sequence,
            self.options.expiry.clone(),
            current,
        ))
    }

    /// Stop scheduling and wait for running background work to drain
    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.context.unregister_db(self.registry_id.load(Ordering::Acquire));

        let mut state = self.state.lock();
        // Wake writers blocked on backpressure so they can see the flag
        self.bg_cv.notify_all();
        while self.is_compaction_scheduled_locked(&state) {
            self.bg_cv.wait(&mut state);
        }
        if let Some(mut log) = state.log.take() {
            let _ = log.sync();
        }
        drop(state);

        // A task may still hold the last reference for a moment; the
        // directory lock must not wait for it
        self.db_lock.lock().take();
        debug!(db = %self.dbname.display(), "Background work drained");
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        self.context.unregister_db(self.registry_id.load(Ordering::Acquire));
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Handle to an open database
///
/// All methods take `&self`; share the engine between threads with an
/// `Arc<Engine>` or scoped threads. Dropping the handle closes the database.
pub struct Engine {
    inner: Arc<DbInner>,
}

impl Engine {
    /// Open or create the database at `path`
    ///
    /// On startup:
    /// 1. start a private background context unless one is supplied
    /// 2. lock the directory, create or recover the manifest
    /// 3. replay unflushed log segments into level-0 tables
    /// 4. wait for overdue level-0 compactions before returning
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<Self> {
        let mut options = sanitize_options(options);
        let context = match &options.context {
            Some(context) => Arc::clone(context),
            None => {
                let context = DbContext::with_defaults()?;
                options.context = Some(Arc::clone(&context));
                context
            }
        };

        let dbname = path.as_ref().to_path_buf();
        info!(db = %dbname.display(), options = ?options, "Opening database");

        let internal = options.is_internal_db;
        let inner = Arc::new(DbInner::new(dbname, Arc::new(options), Arc::clone(&context)));
        let id = context.register_db(Arc::downgrade(&inner), internal);
        inner.registry_id.store(id, Ordering::Release);

        if let Err(e) = inner.open_and_recover() {
            inner.shutdown();
            return Err(e);
        }
        Ok(Self { inner })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Newest value of `key` visible to `options.snapshot` (or the latest
    /// state); deleted and expired keys read as `None`
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    /// Iterator over the database as of `options.snapshot`
    pub fn iter(&self, options: &ReadOptions) -> Result<DbIterator> {
        self.inner.new_iterator(options)
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.lock();
        let sequence = state.versions.last_sequence();
        state.snapshots.create(sequence)
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.inner.state.lock().snapshots.release(&snapshot);
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    /// Store `value` until `expiry` (env micros)
    pub fn put_with_expiry(&self, options: &WriteOptions, key: &[u8], value: &[u8], expiry: ExpiryTime) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_with_expiry(key, value, expiry);
        self.write(options, batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Apply every update of `batch` atomically
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, Some(batch))
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compact the key range `[begin, end]` (`None` is unbounded) down
    /// through every level that holds it
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Value of a `stratakv.*` property, `None` for unknown names
    pub fn property(&self, name: &str) -> Option<String> {
        self.inner.property(name)
    }

    /// Approximate on-disk bytes of each user-key range `[start, limit)`
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let state = self.inner.state.lock();
        let current = state.versions.current();
        ranges
            .iter()
            .map(|(start, limit)| {
                let k1 = InternalKey::new(start, 0, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let k2 = InternalKey::new(limit, 0, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let start = state.versions.approximate_offset_of(&current, &k1);
                let limit = state.versions.approximate_offset_of(&current, &k2);
                limit.saturating_sub(start)
            })
            .collect()
    }

    /// Fail with `Corruption` when some sorted level holds overlapping files
    pub fn verify_levels(&self) -> Result<()> {
        let current = self.inner.state.lock().versions.current();
        match current.verify_levels(0) {
            None => Ok(()),
            Some((level, smallest, largest)) => Err(StrataError::corruption(format!(
                "level-{} has overlapping files near {:?} .. {:?}",
                level, smallest, largest
            ))),
        }
    }

    /// Schedule whatever compaction the current version wants
    pub fn check_available_compactions(&self) {
        self.inner.check_available_compactions();
    }

    /// True while a flush or a compaction is submitted or running
    pub fn is_compaction_scheduled(&self) -> bool {
        let state = self.inner.state.lock();
        self.inner.is_compaction_scheduled_locked(&state)
    }

    /// Wait for background work and release the database
    pub fn close(self) -> Result<()> {
        self.inner.shutdown();
        let state = self.inner.state.lock();
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.inner.dbname
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn context(&self) -> &Arc<DbContext> {
        &self.inner.context
    }

    // =========================================================================
    // Test Hooks
    // =========================================================================

    /// Flush the memtable to a table and wait for it
    pub fn test_compact_memtable(&self) -> Result<()> {
        self.inner.compact_memtable_synchronous()
    }

    /// Compact `[begin, end]` from `level` into `level + 1`
    pub fn test_compact_range(&self, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.test_compact_range(level, begin, end)
    }

    pub fn test_max_next_level_overlapping_bytes(&self) -> u64 {
        self.inner.state.lock().versions.max_next_level_overlapping_bytes()
    }

    pub fn test_num_files_at_level(&self, level: usize) -> usize {
        self.inner.state.lock().versions.num_level_files(level)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("path", &self.inner.dbname).finish()
    }
}

/// Clip options into the ranges the engine supports
fn sanitize_options(mut options: Options) -> Options {
    options.write_buffer_size = options.write_buffer_size.max(MIN_WRITE_BUFFER_SIZE);
    options.max_mem_compact_level = options.max_mem_compact_level.min(NUM_LEVELS - 1);
    options.l0_slowdown_writes_trigger = options.l0_slowdown_writes_trigger.max(options.l0_compaction_trigger);
    options.l0_stop_writes_trigger = options.l0_stop_writes_trigger.max(options.l0_slowdown_writes_trigger);
    options
}
