//! Background Tasks
//!
//! The work items the engine hands to the context's pools.

use std::sync::{Arc, Weak};

use crate::context::DbContext;
use crate::engine::DbInner;
use crate::version::Compaction;

use super::ThreadTask;

/// Run one picked compaction, or the database's pending manual compaction
/// when built without one
pub struct CompactionTask {
    db: Arc<DbInner>,
    compaction: Option<Compaction>,
}

impl CompactionTask {
    pub(crate) fn new(db: Arc<DbInner>, compaction: Compaction) -> Self {
        Self {
            db,
            compaction: Some(compaction),
        }
    }

    pub(crate) fn manual(db: Arc<DbInner>) -> Self {
        Self { db, compaction: None }
    }
}

impl ThreadTask for CompactionTask {
    fn run(&mut self) {
        self.db.background_call(self.compaction.take());

        // Idle compaction capacity: let other databases groom. Goes to a
        // different pool than the one running this task.
        let context = self.db.context();
        if context.compaction_pool().queue_len() == 0 {
            let poll = GroomingPollTask::new(Arc::downgrade(context));
            context.write_pool().submit(Box::new(poll), true);
        }
    }
}

/// Flush the immutable memtable to a level-0 table
pub struct ImmWriteTask {
    db: Arc<DbInner>,
}

impl ImmWriteTask {
    pub(crate) fn new(db: Arc<DbInner>) -> Self {
        Self { db }
    }
}

impl ThreadTask for ImmWriteTask {
    fn run(&mut self) {
        self.db.background_imm_compact_call();
    }
}

/// Ask every open database for grooming work while compaction pools idle
pub struct GroomingPollTask {
    context: Weak<DbContext>,
}

impl GroomingPollTask {
    pub fn new(context: Weak<DbContext>) -> Self {
        Self { context }
    }
}

impl ThreadTask for GroomingPollTask {
    fn run(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.poll_available_compactions();
        }
    }
}
