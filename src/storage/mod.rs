//! Storage Module
//!
//! Persistent table files and the cache of open readers.
//!
//! ## Responsibilities
//! - Build immutable sorted table files from memtables and compactions
//! - Point lookups and seekable iteration over one table
//! - Per-file statistics (tombstones, expiry ranges) for compaction heuristics
//! - Keep readers open across lookups, keyed by file number
//!
//! ## Layout
//! Tables live under one directory per level (`sst_0` .. `sst_6`) and are
//! named by file number; see [`crate::filename`].

mod sstable;
mod table_cache;

pub use sstable::{SSTableBuilder, SSTableIterator, SSTableReader, TableCounters, TableInfo};
pub use table_cache::TableCache;
