//! Env Module
//!
//! The narrow file-system and clock seam the engine goes through. The
//! version set, recovery and compaction code never touch `std::fs` directly;
//! they ask an [`Env`]. [`PosixEnv`] is the standard implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Result, StrataError};

/// Append-only output file
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Flush and fsync
    fn sync(&mut self) -> Result<()>;
}

/// Positioned reads from an immutable file
pub trait RandomAccessFile: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn size(&self) -> u64;
}

/// Storage and clock services consumed by the engine
pub trait Env: Send + Sync {
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;

    /// Read a whole file (log segments, manifest, CURRENT)
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    fn file_exists(&self, path: &Path) -> bool;

    /// File names (not paths) inside `dir`
    fn get_children(&self, dir: &Path) -> Result<Vec<String>>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    fn create_dir_all(&self, dir: &Path) -> Result<()>;

    fn remove_dir(&self, dir: &Path) -> Result<()>;

    fn file_size(&self, path: &Path) -> Result<u64>;

    /// Take the database lock; released when the returned guard drops
    fn lock_file(&self, path: &Path) -> Result<FileLock>;

    /// Wall clock in microseconds since the epoch
    fn now_micros(&self) -> u64;

    fn sleep_for_micros(&self, micros: u64);
}

// =============================================================================
// File Lock
// =============================================================================

// Paths locked by this process. A second open of the same database from
// the same process must fail just like one from another process.
static LOCKED_FILES: Mutex<Vec<PathBuf>> = parking_lot::const_mutex(Vec::new());

/// Held database lock
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        LOCKED_FILES.lock().retain(|p| p != &self.path);
    }
}

// =============================================================================
// PosixEnv
// =============================================================================

/// [`Env`] backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixEnv;

struct PosixWritableFile {
    writer: BufWriter<File>,
}

impl WritableFile for PosixWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

struct PosixRandomAccessFile {
    file: Mutex<BufReader<File>>,
    size: u64,
}

impl RandomAccessFile for PosixRandomAccessFile {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl Env for PosixEnv {
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(PosixWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(PosixWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Box::new(PosixRandomAccessFile {
            file: Mutex::new(BufReader::new(file)),
            size,
        }))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn get_children(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        Ok(())
    }

    fn remove_dir(&self, dir: &Path) -> Result<()> {
        fs::remove_dir(dir)?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn lock_file(&self, path: &Path) -> Result<FileLock> {
        let mut locked = LOCKED_FILES.lock();
        if locked.iter().any(|p| p == path) {
            return Err(StrataError::io(format!(
                "lock {}: already held by process",
                path.display()
            )));
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        locked.push(path.to_path_buf());
        Ok(FileLock {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn sleep_for_micros(&self, micros: u64) {
        thread::sleep(Duration::from_micros(micros));
    }
}

/// Write `data` to `path` and fsync it before returning
pub fn write_string_to_file_sync(env: &dyn Env, data: &[u8], path: &Path) -> Result<()> {
    let mut file = env.new_writable_file(path)?;
    let result = file.append(data).and_then(|_| file.sync());
    if result.is_err() {
        let _ = env.remove_file(path);
    }
    result
}
