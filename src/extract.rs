//! Safe extraction of archive contents to a directory.
//!
//! Extraction never trusts keys: anything absolute, traversing or
//! otherwise unsafe is logged and skipped rather than aborting the
//! whole run. Integrity and I/O faults do abort, per-entry HMAC
//! failures after poisoning the entry.
//!
//! Directory metadata is applied deepest-first so an ancestor whose
//! recorded mode drops the execute bit cannot block a later chmod on
//! its descendant.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::archive::Archive;
use crate::format::{DirectoryEntry, IndexEntry};
use crate::path::validate_extract_key;
use crate::timestamp;
use crate::transform::Pipeline;
use crate::{Error, Result, READ_BUFFER_SIZE};

/// Options for [`Archive::extract`].
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Verify per-entry HMAC tags on entries that carry them. A
    /// mismatch aborts extraction and poisons the entry.
    pub verify_hmac: bool,
}

/// Result of an [`Archive::extract`] call.
#[must_use = "extract result should be checked for skipped entries"]
#[derive(Debug, Clone, Default)]
pub struct ExtractResult {
    /// File entries written out.
    pub entries_extracted: usize,
    /// Entries and directories skipped for unsafe keys.
    pub entries_skipped: usize,
    /// Directory entries whose mode and times were applied.
    pub directories_applied: usize,
    /// Decoded payload bytes written.
    pub bytes_extracted: u64,
}

impl Archive {
    /// Extracts every live entry into `target`.
    ///
    /// Files are written with their recorded mode and mtime/atime;
    /// directory entries are applied afterwards, deepest first. Keys
    /// that fail the safety check are logged and skipped.
    ///
    /// # Errors
    ///
    /// I/O faults and (with [`ExtractOptions::verify_hmac`]) integrity
    /// faults propagate; an HMAC mismatch also removes the partial
    /// output file.
    pub fn extract(
        &mut self,
        target: impl AsRef<Path>,
        options: &ExtractOptions,
    ) -> Result<ExtractResult> {
        if !self.loaded {
            self.load(false)?;
        }
        let target = target.as_ref();
        fs::create_dir_all(target)?;

        let mut result = ExtractResult::default();
        let mut made_dirs: HashSet<PathBuf> = HashSet::new();

        let live: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .map(|(i, _)| i)
            .collect();

        for idx in live {
            let entry = self.entries[idx].clone();
            if let Err(err) = validate_extract_key(&entry.key) {
                log::warn!("skipping entry with unsafe key: {err}");
                result.entries_skipped += 1;
                continue;
            }
            if entry.poisoned {
                return Err(Error::HmacMismatch {
                    entry: Some(entry.key.clone()),
                });
            }

            let dest = join_fs(target, &entry.key);
            if let Some(parent) = dest.parent() {
                if made_dirs.insert(parent.to_path_buf()) {
                    fs::create_dir_all(parent)?;
                }
            }

            match self.extract_entry(&entry, &dest, options) {
                Ok(bytes) => {
                    result.entries_extracted += 1;
                    result.bytes_extracted += bytes;
                }
                Err(err @ Error::HmacMismatch { .. }) => {
                    self.mark_poisoned(&entry.key);
                    if dest.exists() {
                        if let Err(e) = fs::remove_file(&dest) {
                            log::warn!(
                                "failed to clean up partial file '{}': {}",
                                dest.display(),
                                e
                            );
                        }
                    }
                    return Err(err.with_entry(&entry.key));
                }
                Err(err) => return Err(err),
            }
        }

        // Deepest first: key length is a safe proxy since children are
        // always longer than their parents.
        let mut dirs: Vec<DirectoryEntry> = self
            .dirs
            .iter()
            .filter(|d| !d.deleted)
            .cloned()
            .collect();
        dirs.sort_by(|a, b| b.key.len().cmp(&a.key.len()));

        for dir in dirs {
            if let Err(err) = validate_extract_key(&dir.key) {
                log::warn!("skipping directory with unsafe key: {err}");
                result.entries_skipped += 1;
                continue;
            }
            let path = join_fs(target, &dir.key);
            match fs::create_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir_all(&path)?;
                }
                Err(e) => return Err(e.into()),
            }
            apply_mode(&path, dir.mode);
            apply_times(&path, dir.atime_ms, dir.mtime_ms);
            result.directories_applied += 1;
        }

        Ok(result)
    }

    /// Streams one entry's window through the read pipeline into a
    /// fresh file, then applies mode and times.
    fn extract_entry(
        &mut self,
        entry: &IndexEntry,
        dest: &Path,
        options: &ExtractOptions,
    ) -> Result<u64> {
        let verify = options.verify_hmac && entry.hmac;
        let mut pipeline = Pipeline::for_read(
            entry.gzip,
            entry.encryption,
            entry.hmac,
            verify,
            &self.key,
        );

        let mut out = File::create(dest)?;
        self.file.seek(SeekFrom::Start(entry.offset as u64))?;

        let mut remaining = entry.size as u64;
        let mut written: u64 = 0;
        let mut buf = [0u8; READ_BUFFER_SIZE];
        while remaining > 0 {
            let n = (buf.len() as u64).min(remaining) as usize;
            self.file.read_exact(&mut buf[..n])?;
            remaining -= n as u64;
            let chunk = pipeline.update(&buf[..n])?;
            out.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        let tail = pipeline.finish()?;
        out.write_all(&tail)?;
        written += tail.len() as u64;
        drop(out);

        apply_mode(dest, entry.mode);
        apply_times(dest, entry.atime_ms, entry.mtime_ms);
        Ok(written)
    }
}

/// Maps a slash-separated key under the target directory using the
/// platform separator.
fn join_fs(target: &Path, key: &str) -> PathBuf {
    target.join(key.replace('/', std::path::MAIN_SEPARATOR_STR))
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u16) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode as u32)) {
        log::warn!("failed to set permissions on '{}': {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u16) {}

fn apply_times(path: &Path, atime_ms: f64, mtime_ms: f64) {
    let atime = timestamp::to_file_time(atime_ms);
    let mtime = timestamp::to_file_time(mtime_ms);
    if let Err(e) = filetime::set_file_times(path, atime, mtime) {
        log::warn!("failed to set times on '{}': {}", path.display(), e);
    }
}
