//! Version Module
//!
//! The level-structured set of table files and the machinery that evolves it.
//!
//! ## Pieces
//! - [`FileMetaData`]: one table file (number, size, key range, expiry counters)
//! - [`VersionEdit`]: a delta between two versions, and the manifest record format
//! - [`Version`]: an immutable snapshot of every level's files
//! - [`VersionSet`]: owns the current version, the manifest, file numbering,
//!   and decides which compaction runs next
//! - [`Compaction`]: the inputs and output limits of one compaction job
//!
//! ## Lifecycle
//! ```text
//! current Version ──(edit)──► Builder ──► new Version ──► manifest append ──► install
//! ```
//! Readers and compactions hold `Arc<Version>`; a table file is obsolete only
//! once no live version lists it.

mod compaction;
mod edit;
mod version;
mod version_set;

pub use compaction::{Compaction, CompactionKind};
pub use edit::VersionEdit;
pub use version::{total_file_size, CompactionScore, FileMetaData, Version};
pub use version_set::{compute_penalty, smooth_penalty, CompactionStatus, VersionSet};
