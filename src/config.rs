//! Configuration for StrataKV
//!
//! Centralized configuration with sensible defaults: database options, the
//! static per-level traits table, and the background runtime sizing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::context::DbContext;
use crate::engine::Snapshot;
use crate::env::{Env, PosixEnv};
use crate::expiry::ExpiryPolicy;

// =============================================================================
// Level Constants
// =============================================================================

/// Number of levels in the tree
pub const NUM_LEVELS: usize = 7;

/// Levels `0..NUM_OVERLAP_LEVELS` hold files with overlapping key ranges
pub const NUM_OVERLAP_LEVELS: usize = 2;

/// Deepest level a freshly flushed memtable may be pushed to
pub const MAX_MEM_COMPACT_LEVEL: usize = NUM_OVERLAP_LEVELS + 1;

/// Sorted-level output files are cut after this many keys
pub const MAX_KEYS_PER_OUTPUT_FILE: u64 = 300_000;

/// Cap on files pulled from an overlapped level into one compaction
pub const MAX_OVERLAPPED_INPUTS: usize = 100;

// =============================================================================
// Level Traits
// =============================================================================

/// Static sizing of one level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelTrait {
    pub target_file_size: u64,
    /// Bound on grandparent bytes one output file may overlap
    pub max_grandparent_overlap_bytes: u64,
    /// Bound on the greedy widening of source inputs
    pub expanded_compaction_byte_size_limit: u64,
    /// Size at which the write penalty starts growing
    pub max_bytes_for_level: u64,
    /// Size at which a sorted level scores 1.0
    pub desired_bytes_for_level: u64,
    pub max_file_size_for_level: u64,
    /// Files in this level may overlap each other
    pub overlapped: bool,
}

/// The per-level table every compaction decision reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelTraits {
    levels: [LevelTrait; NUM_LEVELS],
}

impl Default for LevelTraits {
    fn default() -> Self {
        const fn lt(
            max_grandparent_overlap_bytes: u64,
            max_bytes_for_level: u64,
            desired_bytes_for_level: u64,
            max_file_size_for_level: u64,
            overlapped: bool,
        ) -> LevelTrait {
            LevelTrait {
                target_file_size: 10_485_760,
                max_grandparent_overlap_bytes,
                expanded_compaction_byte_size_limit: 57_671_680,
                max_bytes_for_level,
                desired_bytes_for_level,
                max_file_size_for_level,
                overlapped,
            }
        }

        Self {
            levels: [
                lt(262_144_000, 209_715_200, 0, 420_000_000, true),
                lt(82_914_560, 419_430_400, 0, 209_715_200, true),
                lt(314_572_800, 3_082_813_440, 200_000_000, 314_572_800, false),
                lt(419_430_400, 6_442_450_944, 4_294_967_296, 419_430_400, false),
                lt(524_288_000, 128_849_018_880, 85_899_345_920, 524_288_000, false),
                lt(629_145_600, 2_576_980_377_600, 1_717_986_918_400, 629_145_600, false),
                lt(734_003_200, 51_539_607_552_000, 34_359_738_368_000, 734_003_200, false),
            ],
        }
    }
}

impl LevelTraits {
    /// Build a table from explicit per-level traits
    pub fn new(levels: [LevelTrait; NUM_LEVELS]) -> Self {
        Self { levels }
    }

    /// Divide every byte bound by `divisor` (small databases and tests)
    pub fn scaled_down(divisor: u64) -> Self {
        let mut traits = Self::default();
        let divisor = divisor.max(1);
        for t in traits.levels.iter_mut() {
            t.target_file_size /= divisor;
            t.max_grandparent_overlap_bytes /= divisor;
            t.expanded_compaction_byte_size_limit /= divisor;
            t.max_bytes_for_level /= divisor;
            t.desired_bytes_for_level /= divisor;
            t.max_file_size_for_level = (t.max_file_size_for_level / divisor).max(1);
        }
        traits
    }

    pub fn level(&self, level: usize) -> &LevelTrait {
        &self.levels[level]
    }

    pub fn overlapped(&self, level: usize) -> bool {
        self.levels[level].overlapped
    }

    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        self.levels[level].max_bytes_for_level
    }

    pub fn desired_bytes_for_level(&self, level: usize) -> u64 {
        self.levels[level].desired_bytes_for_level
    }

    pub fn max_file_size_for_level(&self, level: usize) -> u64 {
        self.levels[level].max_file_size_for_level
    }

    pub fn max_grandparent_overlap_bytes(&self, level: usize) -> u64 {
        self.levels[level].max_grandparent_overlap_bytes
    }

    pub fn expanded_compaction_byte_size_limit(&self, level: usize) -> u64 {
        self.levels[level].expanded_compaction_byte_size_limit
    }
}

// =============================================================================
// Database Options
// =============================================================================

/// Main configuration for a StrataKV database
#[derive(Clone)]
pub struct Options {
    // -------------------------------------------------------------------------
    // Open behavior
    // -------------------------------------------------------------------------
    /// Create the database if it is missing
    pub create_if_missing: bool,

    /// Fail to open if the database already exists
    pub error_if_exists: bool,

    /// Latch background and recovery corruption instead of ignoring it
    pub paranoid_checks: bool,

    /// Verify table checksums while compacting
    pub verify_compactions: bool,

    // -------------------------------------------------------------------------
    // Write path
    // -------------------------------------------------------------------------
    /// Memtable size (bytes) that triggers rotation to an immutable memtable
    pub write_buffer_size: usize,

    /// Level-0 file count that scores a compaction of 1.0
    pub l0_compaction_trigger: usize,

    /// Level-0 file count that allows an early grooming compaction
    pub l0_grooming_trigger: usize,

    /// Level-0 file count that starts the write delay
    pub l0_slowdown_writes_trigger: usize,

    /// Level-0 file count that blocks writers
    pub l0_stop_writes_trigger: usize,

    // -------------------------------------------------------------------------
    // Compaction
    // -------------------------------------------------------------------------
    /// Tombstones in one file that make it a compaction candidate (0 disables)
    pub delete_threshold: u64,

    /// Deepest level a flushed memtable may land in
    pub max_mem_compact_level: usize,

    /// Per-level sizing
    pub level_traits: LevelTraits,

    // -------------------------------------------------------------------------
    // Collaborators
    // -------------------------------------------------------------------------
    /// User key ordering
    pub comparator: Arc<dyn Comparator>,

    /// Optional expiry policy
    pub expiry: Option<Arc<dyn ExpiryPolicy>>,

    /// File system and clock
    pub env: Arc<dyn Env>,

    /// Shared background runtime; a private one is started when `None`
    pub context: Option<Arc<DbContext>>,

    /// Internal databases are not counted as user databases for grooming
    pub is_internal_db: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            verify_compactions: true,
            write_buffer_size: 4 * 1024 * 1024, // 4 MB
            l0_compaction_trigger: 6,
            l0_grooming_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
            delete_threshold: 1000,
            max_mem_compact_level: MAX_MEM_COMPACT_LEVEL,
            level_traits: LevelTraits::default(),
            comparator: Arc::new(BytewiseComparator),
            expiry: None,
            env: Arc::new(PosixEnv),
            context: None,
            is_internal_db: false,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("l0_compaction_trigger", &self.l0_compaction_trigger)
            .field("l0_slowdown_writes_trigger", &self.l0_slowdown_writes_trigger)
            .field("l0_stop_writes_trigger", &self.l0_stop_writes_trigger)
            .field("delete_threshold", &self.delete_threshold)
            .field("max_mem_compact_level", &self.max_mem_compact_level)
            .field("comparator", &self.comparator.name())
            .field("expiry", &self.expiry.is_some())
            .finish()
    }
}

impl Options {
    /// Create a new options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// True when an expiry policy is installed and switched on
    pub fn expiry_activated(&self) -> bool {
        self.expiry.as_ref().map_or(false, |e| e.expiry_activated())
    }
}

/// Builder for Options
#[derive(Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.options.create_if_missing = value;
        self
    }

    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.options.error_if_exists = value;
        self
    }

    pub fn paranoid_checks(mut self, value: bool) -> Self {
        self.options.paranoid_checks = value;
        self
    }

    pub fn verify_compactions(mut self, value: bool) -> Self {
        self.options.verify_compactions = value;
        self
    }

    /// Set the memtable size limit (in bytes)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.options.write_buffer_size = size;
        self
    }

    /// Set the four level-0 file-count triggers at once
    pub fn l0_triggers(mut self, compaction: usize, grooming: usize, slowdown: usize, stop: usize) -> Self {
        self.options.l0_compaction_trigger = compaction;
        self.options.l0_grooming_trigger = grooming;
        self.options.l0_slowdown_writes_trigger = slowdown;
        self.options.l0_stop_writes_trigger = stop;
        self
    }

    pub fn delete_threshold(mut self, count: u64) -> Self {
        self.options.delete_threshold = count;
        self
    }

    pub fn max_mem_compact_level(mut self, level: usize) -> Self {
        self.options.max_mem_compact_level = level.min(MAX_MEM_COMPACT_LEVEL);
        self
    }

    pub fn level_traits(mut self, traits: LevelTraits) -> Self {
        self.options.level_traits = traits;
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.options.comparator = comparator;
        self
    }

    pub fn expiry(mut self, policy: Arc<dyn ExpiryPolicy>) -> Self {
        self.options.expiry = Some(policy);
        self
    }

    pub fn env(mut self, env: Arc<dyn Env>) -> Self {
        self.options.env = env;
        self
    }

    /// Run background work on a shared runtime
    pub fn context(mut self, context: Arc<DbContext>) -> Self {
        self.options.context = Some(context);
        self
    }

    pub fn internal_db(mut self, value: bool) -> Self {
        self.options.is_internal_db = value;
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}

// =============================================================================
// Per-call Options
// =============================================================================

/// Options for reads
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Read as of this snapshot instead of the latest state
    pub snapshot: Option<Snapshot>,

    /// Verify table checksums on every block read
    pub verify_checksums: bool,
}

impl ReadOptions {
    pub fn at(snapshot: &Snapshot) -> Self {
        Self {
            snapshot: Some(snapshot.clone()),
            verify_checksums: false,
        }
    }
}

/// Options for writes
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// fsync the log before acknowledging the write
    pub sync: bool,
}

// =============================================================================
// Background Runtime
// =============================================================================

/// Sizing of the shared background runtime
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Workers flushing immutable memtables
    pub imm_threads: usize,

    /// Workers running grooming polls
    pub write_threads: usize,

    /// Workers compacting level 0
    pub level0_threads: usize,

    /// Workers compacting every other level
    pub compaction_threads: usize,

    /// Period of the write-throttle recalculation
    pub throttle_interval: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            imm_threads: 2,
            write_threads: 3,
            level0_threads: 2,
            compaction_threads: 3,
            throttle_interval: Duration::from_secs(60),
        }
    }
}
