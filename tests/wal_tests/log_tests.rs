//! Tests for log record framing
//!
//! These tests verify:
//! - Records written by LogWriter come back unchanged from LogReader
//! - Fragmentation across 32 KiB blocks and block trailers
//! - Checksum mismatches drop the damaged block and are reported
//! - A torn tail is a silent end of file
//! - Appending to an existing log

use std::fs;
use std::path::{Path, PathBuf};

use stratakv::env::{Env, PosixEnv};
use stratakv::wal::{LogReader, LogWriter, Reporter, BLOCK_SIZE, HEADER_SIZE};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_log() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000001.log");
    (temp_dir, path)
}

fn write_records(path: &Path, records: &[Vec<u8>]) {
    let mut writer = LogWriter::new(PosixEnv.new_writable_file(path).unwrap());
    for record in records {
        writer.add_record(record).unwrap();
    }
    writer.sync().unwrap();
}

fn read_all(data: Vec<u8>, reporter: &mut dyn Reporter, verify: bool) -> Vec<Vec<u8>> {
    let mut reader = LogReader::new(data, reporter, verify);
    let mut out = Vec::new();
    while let Some(record) = reader.read_record() {
        out.push(record);
    }
    out
}

fn filled(byte: u8, len: usize) -> Vec<u8> {
    vec![byte; len]
}

/// Collects every corruption notice
#[derive(Default)]
struct RecordingReporter {
    dropped_bytes: usize,
    reasons: Vec<String>,
}

impl Reporter for RecordingReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        self.dropped_bytes += bytes;
        self.reasons.push(reason.to_string());
    }
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_empty_log_has_no_records() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, &[]);

    let records = read_all(fs::read(&path).unwrap(), &mut (), true);

    assert!(records.is_empty());
}

#[test]
fn test_small_records_round_trip() {
    let (_temp, path) = setup_temp_log();
    let records = vec![b"foo".to_vec(), b"bar".to_vec(), Vec::new(), b"xxxx".to_vec()];
    write_records(&path, &records);

    assert_eq!(read_all(fs::read(&path).unwrap(), &mut (), true), records);
}

#[test]
fn test_record_spanning_several_blocks() {
    let (_temp, path) = setup_temp_log();
    let records = vec![b"small".to_vec(), filled(b'x', 3 * BLOCK_SIZE + 17), b"after".to_vec()];
    write_records(&path, &records);

    let data = fs::read(&path).unwrap();
    assert!(data.len() > 3 * BLOCK_SIZE);
    assert_eq!(read_all(data, &mut (), true), records);
}

#[test]
fn test_record_exactly_filling_block() {
    let (_temp, path) = setup_temp_log();
    let records = vec![filled(b'a', BLOCK_SIZE - HEADER_SIZE), b"next".to_vec()];
    write_records(&path, &records);

    let data = fs::read(&path).unwrap();
    assert_eq!(data.len(), BLOCK_SIZE + HEADER_SIZE + 4);
    assert_eq!(read_all(data, &mut (), true), records);
}

#[test]
fn test_block_trailer_is_padded() {
    let (_temp, path) = setup_temp_log();
    // Leaves 3 bytes in the first block, too few for a header
    let records = vec![filled(b'a', BLOCK_SIZE - 2 * HEADER_SIZE - 3), Vec::new(), b"next".to_vec()];
    write_records(&path, &records);

    let data = fs::read(&path).unwrap();
    assert_eq!(&data[BLOCK_SIZE - 3..BLOCK_SIZE], &[0, 0, 0]);
    assert_eq!(read_all(data, &mut (), true), records);
}

#[test]
fn test_many_records_in_order() {
    let (_temp, path) = setup_temp_log();
    let records: Vec<Vec<u8>> = (0..2000).map(|i| format!("record-{:05}", i).into_bytes()).collect();
    write_records(&path, &records);

    assert_eq!(read_all(fs::read(&path).unwrap(), &mut (), true), records);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_checksum_mismatch_skips_rest_of_block() {
    let (_temp, path) = setup_temp_log();
    let records = vec![
        b"first".to_vec(),
        b"second".to_vec(),
        filled(b'z', BLOCK_SIZE),
        b"survivor".to_vec(),
    ];
    write_records(&path, &records);

    let mut data = fs::read(&path).unwrap();
    // Payload byte of the first record
    data[HEADER_SIZE] ^= 0x01;

    let mut reporter = RecordingReporter::default();
    let read = read_all(data, &mut reporter, true);

    // The big record's tail lands in the second block without its start;
    // only the record after it survives.
    assert_eq!(read, vec![b"survivor".to_vec()]);
    assert!(reporter.reasons.iter().any(|r| r == "checksum mismatch"));
    assert!(reporter.dropped_bytes >= BLOCK_SIZE);
}

#[test]
fn test_checksums_ignored_when_not_verifying() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, &[b"abc".to_vec()]);

    let mut data = fs::read(&path).unwrap();
    data[HEADER_SIZE] = b'x';

    let mut reporter = RecordingReporter::default();
    let read = read_all(data, &mut reporter, false);

    assert_eq!(read, vec![b"xbc".to_vec()]);
    assert!(reporter.reasons.is_empty());
}

#[test]
fn test_unknown_record_type_is_reported() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, &[b"bad".to_vec(), b"good".to_vec()]);

    let mut data = fs::read(&path).unwrap();
    data[6] = 42;

    let mut reporter = RecordingReporter::default();
    let read = read_all(data, &mut reporter, false);

    assert_eq!(read, vec![b"good".to_vec()]);
    assert_eq!(reporter.reasons, vec!["unknown record type".to_string()]);
    assert_eq!(reporter.dropped_bytes, HEADER_SIZE + 3);
}

#[test]
fn test_truncated_tail_is_silent_eof() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, &[b"complete".to_vec(), filled(b'q', 1000)]);

    let mut data = fs::read(&path).unwrap();
    data.truncate(data.len() - 10);

    let mut reporter = RecordingReporter::default();
    let read = read_all(data, &mut reporter, true);

    assert_eq!(read, vec![b"complete".to_vec()]);
    assert!(reporter.reasons.is_empty());
}

#[test]
fn test_truncated_header_is_silent_eof() {
    let (_temp, path) = setup_temp_log();
    write_records(&path, &[b"complete".to_vec(), b"partial".to_vec()]);

    let mut data = fs::read(&path).unwrap();
    let first_len = HEADER_SIZE + b"complete".len();
    data.truncate(first_len + 3);

    let mut reporter = RecordingReporter::default();
    let read = read_all(data, &mut reporter, true);

    assert_eq!(read, vec![b"complete".to_vec()]);
    assert!(reporter.reasons.is_empty());
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_append_to_existing_log() {
    let (_temp, path) = setup_temp_log();
    let first = vec![filled(b'a', BLOCK_SIZE - 100), b"one".to_vec()];
    write_records(&path, &first);

    let existing = fs::metadata(&path).unwrap().len();
    let mut writer = LogWriter::with_offset(PosixEnv.new_appendable_file(&path).unwrap(), existing);
    writer.add_record(&filled(b'b', 500)).unwrap();
    writer.add_record(b"three").unwrap();
    writer.sync().unwrap();

    let read = read_all(fs::read(&path).unwrap(), &mut (), true);

    assert_eq!(read.len(), 4);
    assert_eq!(read[1], b"one");
    assert_eq!(read[2], filled(b'b', 500));
    assert_eq!(read[3], b"three");
}
