//! Database Context
//!
//! The background runtime shared by every database opened with it: the four
//! thread pools, the write throttle, the cached clock, and a registry of
//! open databases used for grooming polls.
//!
//! ## Shutdown (two steps):
//! 1. [`DbContext::shutdown`] stops the throttle thread so nothing new is
//!    scheduled from it
//! 2. the pools are joined; workers finish their current task first
//!
//! Databases hold an `Arc<DbContext>`, so a shared context is only torn
//! down after every database using it has closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use crate::config::ContextOptions;
use crate::engine::DbInner;
use crate::error::Result;
use crate::scheduler::{BoxedTask, HotThreadPool};
use crate::throttle::{CachedClock, ThrottleProbe, WriteThrottle};

// =============================================================================
// Registry
// =============================================================================

struct RegisteredDb {
    id: u64,
    internal: bool,
    db: Weak<DbInner>,
}

/// Open databases, split into user and internal ones
#[derive(Default)]
struct DbRegistry {
    next_id: AtomicU64,
    dbs: Mutex<Vec<RegisteredDb>>,
}

impl DbRegistry {
    fn add(&self, db: Weak<DbInner>, internal: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.dbs.lock().push(RegisteredDb { id, internal, db });
        id
    }

    fn remove(&self, id: u64) {
        self.dbs.lock().retain(|entry| entry.id != id);
    }

    fn count(&self, internal: bool) -> usize {
        self.dbs.lock().iter().filter(|entry| entry.internal == internal).count()
    }

    /// Live databases of one kind; the registry lock is not held while the
    /// caller works on them
    fn collect(&self, internal: bool) -> Vec<Arc<DbInner>> {
        self.dbs
            .lock()
            .iter()
            .filter(|entry| entry.internal == internal)
            .filter_map(|entry| entry.db.upgrade())
            .collect()
    }
}

// =============================================================================
// Pools
// =============================================================================

struct PoolSet {
    imm: HotThreadPool,
    write: HotThreadPool,
    level0: HotThreadPool,
    compaction: HotThreadPool,
}

impl PoolSet {
    fn shutdown(&self) {
        self.imm.shutdown();
        self.write.shutdown();
        self.level0.shutdown();
        self.compaction.shutdown();
    }
}

/// Throttle's view of the pools and registry
struct ContextProbe {
    pools: Arc<PoolSet>,
    registry: Arc<DbRegistry>,
}

impl ContextProbe {
    fn poll(&self) {
        for internal in [false, true] {
            if self.pools.compaction.queue_len() != 0 {
                break;
            }
            for db in self.registry.collect(internal) {
                db.check_available_compactions();
            }
        }
    }
}

impl ThrottleProbe for ContextProbe {
    fn backlogs(&self) -> (u64, u64) {
        (self.pools.level0.queue_len() as u64, self.pools.compaction.queue_len() as u64)
    }

    fn interval_elapsed(&self) {
        self.poll();
    }
}

// =============================================================================
// DbContext
// =============================================================================

pub struct DbContext {
    options: ContextOptions,
    pools: Arc<PoolSet>,
    registry: Arc<DbRegistry>,
    throttle: WriteThrottle,
}

impl std::fmt::Debug for DbContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContext")
            .field("options", &self.options)
            .field("user_dbs", &self.registry.count(false))
            .field("internal_dbs", &self.registry.count(true))
            .finish()
    }
}

impl DbContext {
    /// Start the pools and the throttle thread
    pub fn new(options: ContextOptions) -> Result<Arc<Self>> {
        let pools = Arc::new(PoolSet {
            imm: HotThreadPool::new("stratakv-imm", options.imm_threads)?,
            write: HotThreadPool::new("stratakv-write", options.write_threads)?,
            level0: HotThreadPool::new("stratakv-level0", options.level0_threads)?,
            compaction: HotThreadPool::new("stratakv-compact", options.compaction_threads)?,
        });
        let registry = Arc::new(DbRegistry::default());

        let probe = Arc::new(ContextProbe {
            pools: Arc::clone(&pools),
            registry: Arc::clone(&registry),
        });
        let throttle = WriteThrottle::start(options.throttle_interval, Arc::new(CachedClock::new()), probe)?;

        info!(
            imm = options.imm_threads,
            write = options.write_threads,
            level0 = options.level0_threads,
            compaction = options.compaction_threads,
            "Database context started"
        );

        Ok(Arc::new(Self {
            options,
            pools,
            registry,
            throttle,
        }))
    }

    /// Context with default sizing
    pub fn with_defaults() -> Result<Arc<Self>> {
        Self::new(ContextOptions::default())
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn imm_pool(&self) -> &HotThreadPool {
        &self.pools.imm
    }

    pub fn write_pool(&self) -> &HotThreadPool {
        &self.pools.write
    }

    pub fn level0_pool(&self) -> &HotThreadPool {
        &self.pools.level0
    }

    pub fn compaction_pool(&self) -> &HotThreadPool {
        &self.pools.compaction
    }

    /// Submit a compaction to the pool matching its source level
    pub fn submit_compaction(&self, task: BoxedTask, level0: bool, ok_to_queue: bool) -> bool {
        if level0 {
            self.pools.level0.submit(task, ok_to_queue)
        } else {
            self.pools.compaction.submit(task, ok_to_queue)
        }
    }

    pub fn throttle(&self) -> &WriteThrottle {
        &self.throttle
    }

    pub fn clock(&self) -> &Arc<CachedClock> {
        self.throttle.clock()
    }

    // =========================================================================
    // Registry
    // =========================================================================

    pub(crate) fn register_db(&self, db: Weak<DbInner>, internal: bool) -> u64 {
        self.registry.add(db, internal)
    }

    pub(crate) fn unregister_db(&self, id: u64) {
        self.registry.remove(id);
    }

    /// Open user (non-internal) databases
    pub fn user_db_count(&self) -> usize {
        self.registry.count(false)
    }

    pub fn internal_db_count(&self) -> usize {
        self.registry.count(true)
    }

    /// Offer idle compaction capacity to user databases, then internal ones
    pub fn poll_available_compactions(&self) {
        ContextProbe {
            pools: Arc::clone(&self.pools),
            registry: Arc::clone(&self.registry),
        }
        .poll();
    }

    /// Stop the throttle thread, then the pools
    pub fn shutdown(&self) {
        self.throttle.stop_thread();
        self.pools.shutdown();
    }
}

impl Drop for DbContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
