//! Database file naming
//!
//! ```text
//! {db}/
//!   ├── CURRENT              (name of the live manifest)
//!   ├── LOCK
//!   ├── MANIFEST-000005
//!   ├── 000007.log           (write-ahead log segments)
//!   ├── 000008.dbtmp
//!   ├── sst_0/000009.sst     (one directory per level)
//!   └── sst_6/...
//! ```

use std::path::{Path, PathBuf};

use crate::config::NUM_LEVELS;
use crate::env::{write_string_to_file_sync, Env};
use crate::error::{Result, StrataError};

/// Kind of file found in a database directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    DbLock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
}

pub fn log_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{:06}.log", number))
}

pub fn table_dir_name(db: &Path, level: usize) -> PathBuf {
    db.join(format!("sst_{}", level))
}

/// Tables live under the directory of the level that holds them
pub fn table_file_name(db: &Path, number: u64, level: usize) -> PathBuf {
    table_dir_name(db, level).join(format!("{:06}.sst", number))
}

pub fn descriptor_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("MANIFEST-{:06}", number))
}

pub fn current_file_name(db: &Path) -> PathBuf {
    db.join("CURRENT")
}

pub fn lock_file_name(db: &Path) -> PathBuf {
    db.join("LOCK")
}

pub fn temp_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{:06}.dbtmp", number))
}

/// Classify a bare file name
///
/// "000042.log" → Some((42, Log)), "MANIFEST-000003" → Some((3, Descriptor))
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    match name {
        "CURRENT" => return Some((0, FileType::Current)),
        "LOCK" => return Some((0, FileType::DbLock)),
        "LOG" | "LOG.old" => return Some((0, FileType::InfoLog)),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return parse_decimal(rest).map(|n| (n, FileType::Descriptor));
    }

    let (stem, suffix) = name.split_once('.')?;
    let number = parse_decimal(stem)?;
    let file_type = match suffix {
        "log" => FileType::Log,
        "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((number, file_type))
}

fn parse_decimal(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Point CURRENT at MANIFEST-`descriptor_number` via a temp file and rename
pub fn set_current_file(env: &dyn Env, db: &Path, descriptor_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{:06}\n", descriptor_number);
    let tmp = temp_file_name(db, descriptor_number);
    write_string_to_file_sync(env, contents.as_bytes(), &tmp)?;
    if let Err(e) = env.rename_file(&tmp, &current_file_name(db)) {
        let _ = env.remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Read CURRENT and return the manifest file name it names
pub fn read_current_file(env: &dyn Env, db: &Path) -> Result<String> {
    let raw = env.read_file(&current_file_name(db))?;
    let text = String::from_utf8(raw)
        .map_err(|_| StrataError::corruption("CURRENT file is not valid UTF-8"))?;
    match text.strip_suffix('\n') {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(StrataError::corruption("CURRENT file does not end with newline")),
    }
}

pub fn make_level_directories(env: &dyn Env, db: &Path) -> Result<()> {
    for level in 0..NUM_LEVELS {
        env.create_dir_all(&table_dir_name(db, level))?;
    }
    Ok(())
}
