//! Shared test utilities for integration tests.
//!
//! Note: `#![allow(dead_code)]` is required because each integration
//! test file compiles as a separate crate and may only use a subset of
//! these helpers.

#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use jpk::{AddEntry, AddOptions, Archive, OpenMode, SecretKey};

/// Creates a fresh archive at `path` holding the given in-memory
/// entries, written with `options`.
pub fn create_archive(
    path: &Path,
    key: &SecretKey,
    entries: &[(&str, &[u8])],
    options: &AddOptions,
) -> jpk::Result<Archive> {
    let mut archive = Archive::open(path, key.clone(), OpenMode::New)?;
    if !entries.is_empty() {
        let batch: Vec<AddEntry> = entries
            .iter()
            .map(|(k, d)| AddEntry::bytes(*k, *d))
            .collect();
        let _ = archive.add(batch, options)?;
    }
    Ok(archive)
}

/// Reopens an archive and loads its metadata without verification.
pub fn reopen(path: &Path, key: &SecretKey) -> jpk::Result<Archive> {
    let mut archive = Archive::open(path, key.clone(), OpenMode::Existing)?;
    archive.load(false)?;
    Ok(archive)
}

/// Flips one bit of the file at `offset`.
pub fn flip_byte(path: &Path, offset: u64) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[offset as usize] ^= 0x01;
    std::fs::write(path, bytes).unwrap();
}

/// Appends raw bytes to the archive file, bypassing the library.
pub fn append_raw(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
}

/// Hand-assembles an index record (big-endian wire layout) so tests can
/// plant keys the writer would refuse.
pub fn raw_index_record(
    key: &str,
    offset: u32,
    size: u32,
    mode: u16,
    mtime_ms: f64,
    atime_ms: f64,
    extra_flags: u8,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(29 + key.len());
    buf.push(1u8 | extra_flags); // record type 1 = index
    buf.extend_from_slice(&offset.to_be_bytes());
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&mode.to_be_bytes());
    buf.extend_from_slice(&mtime_ms.to_be_bytes());
    buf.extend_from_slice(&atime_ms.to_be_bytes());
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf
}

/// Gzips bytes the same way the write pipeline does, for size
/// comparisons.
pub fn gzip_reference(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}
