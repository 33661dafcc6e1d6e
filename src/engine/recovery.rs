//! Recovery
//!
//! Opening a database:
//! 1. lock the directory, create a fresh database when allowed
//! 2. rebuild the version set from the manifest
//! 3. replay every log segment the manifest does not cover yet, flushing
//!    replayed memtables straight to level 0
//! 4. start a new log and record it with a single manifest edit

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Options, NUM_LEVELS};
use crate::error::{Result, StrataError};
use crate::filename::{
    current_file_name, descriptor_file_name, lock_file_name, log_file_name, make_level_directories, parse_file_name,
    set_current_file, table_dir_name, FileType,
};
use crate::key::SequenceNumber;
use crate::memtable::MemTable;
use crate::version::{VersionEdit, VersionSet};
use crate::wal::{LogReader, LogWriter, Reporter};
use crate::write_batch::{WriteBatch, BATCH_HEADER};

use super::{DbInner, StateGuard};

/// Collects corruption found while replaying a log segment
struct LogReporter {
    file: String,
    paranoid: bool,
    error: Option<StrataError>,
}

impl Reporter for LogReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        warn!(
            file = %self.file,
            bytes,
            reason,
            ignored = !self.paranoid,
            "Log corruption: dropping {} bytes",
            bytes
        );
        if self.paranoid && self.error.is_none() {
            self.error = Some(StrataError::corruption(format!("{}: {}", self.file, reason)));
        }
    }
}

impl DbInner {
    /// Everything `Engine::open` does after the handle exists
    pub(super) fn open_and_recover(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();

        let mut edit = VersionEdit::new();
        self.recover(&mut state, &mut edit)?;

        let log_number = state.versions.new_file_number();
        self.open_log_file(&mut state, log_number)?;
        edit.set_log_number(log_number);
        edit.set_prev_log_number(0);
        VersionSet::log_and_apply(&mut state, &mut edit)?;

        self.delete_obsolete_files(&mut state);
        self.check_compaction_state(&mut state);

        info!(
            db = %self.dbname.display(),
            log_number,
            last_sequence = state.versions.last_sequence(),
            summary = %state.versions.level_summary(),
            "Database opened"
        );
        Ok(())
    }

    /// Write the manifest of an empty database and point CURRENT at it
    fn new_db(&self) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        edit.set_log_number(0);
        edit.set_next_file(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(&self.dbname, 1);
        let written = (|| -> Result<()> {
            let file = self.env.new_writable_file(&manifest)?;
            let mut log = LogWriter::new(file);
            let mut record = Vec::new();
            edit.encode_to(&mut record, self.options.expiry_activated());
            log.add_record(&record)?;
            log.sync()?;
            set_current_file(self.env.as_ref(), &self.dbname, 1)
        })();

        if written.is_err() {
            let _ = self.env.remove_file(&manifest);
        }
        written
    }

    fn recover(&self, state: &mut StateGuard<'_>, edit: &mut VersionEdit) -> Result<()> {
        // Ignore the error: the directory may already exist
        let _ = self.env.create_dir_all(&self.dbname);

        let lock = self.env.lock_file(&lock_file_name(&self.dbname))?;
        *self.db_lock.lock() = Some(lock);

        if !self.env.file_exists(&current_file_name(&self.dbname)) {
            if !self.options.create_if_missing {
                return Err(StrataError::invalid_argument(format!(
                    "{} does not exist (create_if_missing is false)",
                    self.dbname.display()
                )));
            }
            info!(db = %self.dbname.display(), "Creating new database");
            self.new_db()?;
        } else if self.options.error_if_exists {
            return Err(StrataError::invalid_argument(format!(
                "{} exists (error_if_exists is true)",
                self.dbname.display()
            )));
        }

        state.versions.recover()?;
        make_level_directories(self.env.as_ref(), &self.dbname)?;

        // Logs newer than the manifest's log number, plus the one a
        // previous incarnation may have been switching away from
        let min_log = state.versions.log_number();
        let prev_log = state.versions.prev_log_number();
        let mut logs: Vec<u64> = self
            .env
            .get_children(&self.dbname)?
            .iter()
            .filter_map(|name| parse_file_name(name))
            .filter(|&(number, file_type)| file_type == FileType::Log && (number >= min_log || number == prev_log))
            .map(|(number, _)| number)
            .collect();
        logs.sort_unstable();

        let mut max_sequence: SequenceNumber = 0;
        for number in logs {
            self.recover_log_file(state, number, edit, &mut max_sequence)?;
            state.versions.mark_file_number_used(number);
        }

        if state.versions.last_sequence() < max_sequence {
            state.versions.set_last_sequence(max_sequence);
        }
        Ok(())
    }

    /// Replay one log segment into memtables, flushing each to level 0
    fn recover_log_file(
        &self,
        state: &mut StateGuard<'_>,
        number: u64,
        edit: &mut VersionEdit,
        max_sequence: &mut SequenceNumber,
    ) -> Result<()> {
        let path = log_file_name(&self.dbname, number);
        let contents = self.env.read_file(&path)?;
        info!(log_number = number, bytes = contents.len(), "Recovering log #{}", number);

        let mut reporter = LogReporter {
            file: path.display().to_string(),
            paranoid: self.options.paranoid_checks,
            error: None,
        };

        let mut records = Vec::new();
        let mut short_records = Vec::new();
        {
            let mut reader = LogReader::new(contents, &mut reporter, true);
            while let Some(record) = reader.read_record() {
                if record.len() < BATCH_HEADER {
                    short_records.push(record.len());
                } else {
                    records.push(record);
                }
            }
        }
        for len in short_records {
            reporter.corruption(len, "log record too small");
        }
        if let Some(e) = reporter.error.take() {
            return Err(e);
        }

        let expiry = self.options.expiry.clone();
        let mut mem: Option<Arc<MemTable>> = None;
        for record in records {
            let applied = WriteBatch::from_contents(&record).and_then(|batch| {
                let table = mem.get_or_insert_with(|| Arc::new(MemTable::new(self.icmp.clone())));
                batch.insert_into(table, expiry.as_deref())?;
                Ok(batch)
            });
            let batch = match applied {
                Ok(batch) => batch,
                Err(e) if self.options.paranoid_checks => return Err(e),
                Err(e) => {
                    warn!(log_number = number, error = %e, "Ignoring damaged batch");
                    continue;
                }
            };
            let Some(table) = mem.as_ref() else {
                continue;
            };

            let last = batch.sequence() + u64::from(batch.count()).saturating_sub(1);
            if last > *max_sequence {
                *max_sequence = last;
            }

            if table.approximate_memory_usage() > self.options.write_buffer_size {
                let full = Arc::clone(table);
                mem = None;
                self.write_level0_table(state, &full, edit, None)?;
            }
        }

        if let Some(table) = mem {
            self.write_level0_table(state, &table, edit, None)?;
        }
        Ok(())
    }
}

/// Delete every file of the database at `path`, then the directories
pub fn destroy_db(path: impl AsRef<Path>, options: &Options) -> Result<()> {
    let path = path.as_ref();
    let env = options.env.as_ref();
    let Ok(children) = env.get_children(path) else {
        // Nothing to destroy
        return Ok(());
    };

    let lock_path = lock_file_name(path);
    let lock = env.lock_file(&lock_path)?;
    let mut result = Ok(());

    for level in 0..NUM_LEVELS {
        let dir = table_dir_name(path, level);
        if let Ok(tables) = env.get_children(&dir) {
            for name in tables {
                if let Err(e) = env.remove_file(&dir.join(&name)) {
                    result = result.and(Err(e));
                }
            }
        }
        let _ = env.remove_dir(&dir);
    }

    for name in children {
        match parse_file_name(&name) {
            Some((_, FileType::DbLock)) | None => {}
            Some(_) => {
                if let Err(e) = env.remove_file(&path.join(&name)) {
                    result = result.and(Err(e));
                }
            }
        }
    }

    drop(lock);
    let _ = env.remove_file(&lock_path);
    let _ = env.remove_dir(path);
    result
}
