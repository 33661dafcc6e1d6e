//! MemTable Module
//!
//! In-memory sorted write buffer.
//!
//! ## Responsibilities
//! - Append-only insert of versioned records (never overwrite in place)
//! - Newest-visible lookups against a snapshot sequence
//! - Track approximate memory for the rotation trigger
//! - Ordered iteration for flushes and database iterators
//!
//! ## Data Structure Choice
//! `crossbeam_skiplist::SkipMap` keyed by internal key:
//! - One writer (the head of the writer queue) and any number of readers
//!   without an external lock
//! - Shared as `Arc<MemTable>` so an iterator keeps a retired table alive

mod table;

pub use table::{MemGet, MemTable, MemTableIterator};
