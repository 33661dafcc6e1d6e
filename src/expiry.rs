//! Expiry Policy
//!
//! The optional plug-in that stamps write times on incoming values, decides
//! whether a stored key has expired, and nominates whole table files for
//! deletion once every key inside them has aged out.
//!
//! The engine only talks to the [`ExpiryPolicy`] trait. [`ExpiryModuleOs`]
//! is the stock implementation driven by four settings:
//!
//! ```text
//! expiry_enabled      master switch
//! expiry_minutes      age limit for write-time stamped keys (0 = none)
//! expiry_unlimited    write-time keys never age out
//! whole_file_expiry   allow dropping entire files without compaction
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::NUM_LEVELS;
use crate::key::{extract_expiry, extract_value_type, ExpiryTime, ParsedInternalKey, ValueType};
use crate::storage::TableCounters;
use crate::throttle::CachedClock;
use crate::version::{FileMetaData, Version, VersionEdit};

const MICROS_PER_MINUTE: u64 = 60 * 1_000_000;

/// Callback contract consulted by the write path, reads, compactions and
/// the table builder
pub trait ExpiryPolicy: Send + Sync {
    /// True when the policy may expire anything at all
    fn expiry_activated(&self) -> bool {
        false
    }

    /// Chance to rewrite the type and expiry of an incoming record
    fn memtable_inserter_callback(
        &self,
        _key: &[u8],
        _value: &[u8],
        _value_type: &mut ValueType,
        _expiry: &mut ExpiryTime,
    ) -> bool {
        true
    }

    /// True when the key has expired
    fn key_retirement_callback(&self, _key: &ParsedInternalKey<'_>) -> bool {
        false
    }

    /// Fold one key into the statistics of the table being built
    fn table_builder_callback(&self, _internal_key: &[u8], _counters: &mut TableCounters) {}

    /// True when the encoded internal key has expired
    fn memtable_callback(&self, internal_key: &[u8]) -> bool {
        ParsedInternalKey::parse(internal_key).map_or(false, |k| self.key_retirement_callback(&k))
    }

    /// True when at least one file of `level` may be deleted outright;
    /// with an edit, every such file is recorded as deleted
    fn compaction_finalize_callback(
        &self,
        _want_all: bool,
        _version: &Version,
        _level: usize,
        _edit: Option<&mut VersionEdit>,
    ) -> bool {
        false
    }
}

// =============================================================================
// ExpiryModuleOs
// =============================================================================

/// Stock expiry policy
#[derive(Debug, Clone, Default)]
pub struct ExpiryModuleOs {
    pub expiry_enabled: bool,
    pub expiry_minutes: u64,
    pub expiry_unlimited: bool,
    pub whole_file_expiry: bool,
    clock: Option<Arc<CachedClock>>,
}

impl ExpiryModuleOs {
    pub fn new(expiry_minutes: u64) -> Self {
        Self {
            expiry_enabled: true,
            expiry_minutes,
            expiry_unlimited: false,
            whole_file_expiry: true,
            clock: None,
        }
    }

    pub fn unlimited(mut self, value: bool) -> Self {
        self.expiry_unlimited = value;
        self
    }

    pub fn whole_file_expiry(mut self, value: bool) -> Self {
        self.whole_file_expiry = value;
        self
    }

    pub fn enabled(mut self, value: bool) -> Self {
        self.expiry_enabled = value;
        self
    }

    /// Read time from a shared cached clock instead of the wall clock
    pub fn with_clock(mut self, clock: Arc<CachedClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn now_micros(&self) -> u64 {
        match &self.clock {
            Some(clock) => clock.now_micros(),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0),
        }
    }

    /// True when every key in `file` has expired as of `now_micros`
    ///
    /// A file holding any plain value has `exp_write_low == 0` and never
    /// qualifies. A file of nothing but tombstones has no expiry at all and
    /// does not qualify either.
    pub fn is_file_expired(&self, file: &FileMetaData, now_micros: u64) -> bool {
        let aged_micros = now_micros.saturating_sub(self.expiry_minutes * MICROS_PER_MINUTE);

        self.expiry_enabled
            && self.whole_file_expiry
            && file.exp_write_low != 0
            && (file.exp_write_high != 0 || file.exp_explicit_high != 0)
            && ((file.exp_write_high <= aged_micros && self.expiry_minutes != 0 && !self.expiry_unlimited)
                || file.exp_write_high == 0)
            && (file.exp_explicit_high == 0 || file.exp_explicit_high <= now_micros)
    }
}

impl ExpiryPolicy for ExpiryModuleOs {
    fn expiry_activated(&self) -> bool {
        self.expiry_enabled
    }

    fn memtable_inserter_callback(
        &self,
        _key: &[u8],
        _value: &[u8],
        value_type: &mut ValueType,
        expiry: &mut ExpiryTime,
    ) -> bool {
        let stamp = (*value_type == ValueType::ValueWriteTime && *expiry == 0)
            || (*value_type == ValueType::Value
                && (self.expiry_minutes != 0 || self.expiry_unlimited)
                && self.expiry_enabled);
        if stamp {
            *value_type = ValueType::ValueWriteTime;
            *expiry = self.now_micros();
        }
        true
    }

    fn key_retirement_callback(&self, key: &ParsedInternalKey<'_>) -> bool {
        if !self.expiry_enabled {
            return false;
        }
        match key.value_type {
            ValueType::ValueWriteTime => {
                self.expiry_minutes != 0
                    && key.expiry != 0
                    && !self.expiry_unlimited
                    && key.expiry + self.expiry_minutes * MICROS_PER_MINUTE <= self.now_micros()
            }
            ValueType::ValueExplicitExpiry => key.expiry != 0 && key.expiry <= self.now_micros(),
            ValueType::Deletion | ValueType::Value => false,
        }
    }

    // Counters are kept even while expiry is disabled.
    fn table_builder_callback(&self, internal_key: &[u8], counters: &mut TableCounters) {
        let expires = extract_expiry(internal_key);

        if counters.keys == 1 {
            counters.exp_write_low = u64::MAX;
        }

        match extract_value_type(internal_key) {
            Some(ValueType::ValueWriteTime) => {
                counters.exp_write_low = counters.exp_write_low.min(expires);
                counters.exp_write_high = counters.exp_write_high.max(expires);
                if self.memtable_callback(internal_key) {
                    counters.delete_count += 1;
                }
            }
            Some(ValueType::ValueExplicitExpiry) => {
                counters.exp_explicit_high = counters.exp_explicit_high.max(expires);
                if self.memtable_callback(internal_key) {
                    counters.delete_count += 1;
                }
            }
            Some(ValueType::Value) => counters.exp_write_low = 0,
            Some(ValueType::Deletion) | None => {}
        }
    }

    fn compaction_finalize_callback(
        &self,
        want_all: bool,
        version: &Version,
        level: usize,
        mut edit: Option<&mut VersionEdit>,
    ) -> bool {
        if !self.expiry_enabled {
            return false;
        }

        let now = self.now_micros();
        let mut found = false;

        for file in version.files(level) {
            let mut expired = self.is_file_expired(file, now);

            // Deeper data for the same keys would resurface.
            if expired {
                let small = file.smallest.user_key();
                let large = file.largest.user_key();
                expired = ((level + 1)..NUM_LEVELS)
                    .all(|deeper| !version.overlap_in_level(deeper, Some(small), Some(large)));
                found |= expired;
            }

            if expired {
                if let Some(edit) = edit.as_deref_mut() {
                    edit.delete_file(level, file.number);
                }
                if !want_all {
                    break;
                }
            }
        }

        found
    }
}
