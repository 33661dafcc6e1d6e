//! # StrataKV
//!
//! An embedded, leveled LSM-tree key-value store with:
//! - Group-commit write path over a write-ahead log
//! - Overlapped (levels 0-1) and sorted (levels 2+) table levels
//! - Score-based, grooming and whole-file-expiry compactions
//! - Adaptive write throttling from measured compaction cost
//! - Snapshots and consistent iterators
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │        (writer queue, snapshots, reads, properties)         │
//! └──────┬───────────────────────┬──────────────────────┬───────┘
//!        │                       │                      │
//!        ▼                       ▼                      ▼
//!   ┌──────────┐          ┌─────────────┐        ┌─────────────┐
//!   │   WAL    │          │  MemTable   │        │ VersionSet  │
//!   │ (append) │          │ (skip list) │        │ (manifest)  │
//!   └──────────┘          └──────┬──────┘        └──────┬──────┘
//!                                │ flush                │ pick
//!                                ▼                      ▼
//!                         ┌─────────────────────────────────────┐
//!                         │         DbContext (shared)          │
//!                         │  imm / write / level0 / compaction  │
//!                         │     pools, write throttle, clock    │
//!                         └──────────────────┬──────────────────┘
//!                                            ▼
//!                                   ┌─────────────────┐
//!                                   │ SSTables L0..L6 │
//!                                   └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod coding;
pub mod comparator;
pub mod key;
pub mod env;
pub mod filename;

pub mod wal;
pub mod write_batch;
pub mod memtable;
pub mod storage;
pub mod iterator;
pub mod version;
pub mod expiry;

pub mod throttle;
pub mod scheduler;
pub mod context;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{ContextOptions, LevelTraits, Options, ReadOptions, WriteOptions};
pub use context::DbContext;
pub use engine::{destroy_db, DbIterator, Engine, Snapshot};
pub use error::{Result, StrataError};
pub use expiry::{ExpiryModuleOs, ExpiryPolicy};
pub use write_batch::WriteBatch;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of StrataKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
