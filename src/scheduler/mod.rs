//! Scheduler Module
//!
//! Background thread pools and the tasks they run.
//!
//! ## Pools (one set per [`DbContext`](crate::context::DbContext))
//! - imm: immutable memtable flushes
//! - write: grooming polls
//! - level0: compactions out of level 0
//! - compaction: every other compaction

mod hot_threads;
mod tasks;

pub use hot_threads::{BoxedTask, HotThreadPool, PoolStats, ThreadTask};
pub use tasks::{CompactionTask, GroomingPollTask, ImmWriteTask};
