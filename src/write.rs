//! Archive writing: the `add` session.
//!
//! One [`Archive::add`] call appends a single datablock followed by the
//! directory and index records of everything it wrote:
//!
//! ```text
//! [datablock prelude][entry payloads...][directory records][index records]
//! ```
//!
//! The prelude is written first with a zero size and rewritten once the
//! payload total is known. Entry payloads stream through the write
//! pipeline (gzip → cipher → hmac) as the effective flags dictate;
//! nothing is buffered whole.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::archive::Archive;
use crate::crypto;
use crate::format::{self, DirectoryEntry, IndexEntry};
use crate::path::{join_key, validate_key_len, validate_prefix};
use crate::timestamp;
use crate::transform::Pipeline;
use crate::{Error, Result, READ_BUFFER_SIZE};

/// Filesystem-style metadata for entries that do not come from disk.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// POSIX permission bits.
    pub mode: u16,
    /// Modification time, milliseconds since the Unix epoch.
    pub mtime_ms: f64,
    /// Access time, milliseconds since the Unix epoch.
    pub atime_ms: f64,
}

impl Default for EntryMeta {
    /// Mode `0o644` and the current time.
    fn default() -> Self {
        let now = timestamp::now_ms();
        Self {
            mode: 0o644,
            mtime_ms: now,
            atime_ms: now,
        }
    }
}

impl EntryMeta {
    /// Defaults for a directory marker: mode `0o755` and now.
    pub fn directory() -> Self {
        Self {
            mode: 0o755,
            ..Self::default()
        }
    }
}

/// One source handed to [`Archive::add`].
pub enum AddSource {
    /// A file or directory on disk. Directories are walked recursively
    /// (symlinks are skipped, never followed).
    Path(PathBuf),
    /// An in-memory buffer with an explicit key.
    Bytes {
        /// Entry key, before prefixing.
        key: String,
        /// Payload bytes.
        data: Vec<u8>,
        /// Metadata to record.
        meta: EntryMeta,
    },
    /// An arbitrary byte stream with an explicit key.
    Reader {
        /// Entry key, before prefixing.
        key: String,
        /// Payload source, drained to EOF.
        reader: Box<dyn Read>,
        /// Metadata to record.
        meta: EntryMeta,
    },
    /// An explicit directory marker; no payload is written.
    Directory {
        /// Directory key, before prefixing.
        key: String,
        /// Metadata to record.
        meta: EntryMeta,
    },
}

/// An entry in an [`Archive::add`] batch, with optional per-entry
/// overrides of the session's pipeline flags.
pub struct AddEntry {
    source: AddSource,
    prefix: String,
    gzip: Option<bool>,
    encryption: Option<bool>,
    hmac: Option<bool>,
}

impl AddEntry {
    fn new(source: AddSource) -> Self {
        Self {
            source,
            prefix: String::new(),
            gzip: None,
            encryption: None,
            hmac: None,
        }
    }

    /// An entry backed by a file or directory on disk.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::new(AddSource::Path(path.into()))
    }

    /// An in-memory entry with default metadata.
    pub fn bytes(key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::bytes_with_meta(key, data, EntryMeta::default())
    }

    /// An in-memory entry with explicit metadata.
    pub fn bytes_with_meta(
        key: impl Into<String>,
        data: impl Into<Vec<u8>>,
        meta: EntryMeta,
    ) -> Self {
        Self::new(AddSource::Bytes {
            key: key.into(),
            data: data.into(),
            meta,
        })
    }

    /// An entry fed from an arbitrary reader.
    pub fn reader(key: impl Into<String>, reader: Box<dyn Read>) -> Self {
        Self::new(AddSource::Reader {
            key: key.into(),
            reader,
            meta: EntryMeta::default(),
        })
    }

    /// A directory marker.
    pub fn directory(key: impl Into<String>) -> Self {
        Self::directory_with_meta(key, EntryMeta::directory())
    }

    /// A directory marker with explicit metadata.
    pub fn directory_with_meta(key: impl Into<String>, meta: EntryMeta) -> Self {
        Self::new(AddSource::Directory {
            key: key.into(),
            meta,
        })
    }

    /// Prepends an extra per-entry prefix (applied after the session
    /// prefix).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Overrides the session's gzip flag for this entry.
    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = Some(gzip);
        self
    }

    /// Overrides the session's encryption flag for this entry.
    pub fn with_encryption(mut self, encryption: bool) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Overrides the session's hmac flag for this entry.
    pub fn with_hmac(mut self, hmac: bool) -> Self {
        self.hmac = Some(hmac);
        self
    }
}

/// Session-wide options for one [`Archive::add`] call.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Prefix prepended to every key. Must be relative and free of
    /// traversal segments.
    pub prefix: String,
    /// Gzip payloads by default.
    pub gzip: bool,
    /// Encrypt payloads (and on-disk keys) by default.
    pub encryption: bool,
    /// Append per-entry HMAC tags by default.
    pub hmac: bool,
}

/// Result of an [`Archive::add`] call.
#[must_use = "add result should be checked to verify what was written"]
#[derive(Debug, Clone, Default)]
pub struct AddResult {
    /// Number of file entries written.
    pub entries_written: usize,
    /// Number of directory entries recorded.
    pub directories_written: usize,
    /// Payload bytes written into the datablock (post-pipeline).
    pub bytes_written: u64,
}

#[derive(Clone, Copy)]
struct EntryFlags {
    gzip: bool,
    encryption: bool,
    hmac: bool,
}

#[derive(Default)]
struct WriteSession {
    pending_dirs: Vec<DirectoryEntry>,
    pending_index: Vec<IndexEntry>,
}

impl Archive {
    /// Appends a batch of entries as one datablock + directory + index
    /// grouping.
    ///
    /// File order within the call is payloads first (in entry order),
    /// then all directory records, then all index records. Keys are
    /// `join(options.prefix, entry.prefix, basename-or-key)`.
    ///
    /// # Errors
    ///
    /// Fails [`Error::InvalidPrefix`] for unsafe prefixes and
    /// [`Error::KeyTooLarge`] for oversized keys; I/O and pipeline
    /// faults propagate. A failed call may leave a partial grouping
    /// behind; the parser reports it as a truncated record on the next
    /// load.
    pub fn add(&mut self, entries: Vec<AddEntry>, options: &AddOptions) -> Result<AddResult> {
        validate_prefix(&options.prefix)?;
        if !self.loaded {
            self.load(false)?;
        }

        let prelude_offset = self.eof;
        self.write_at_eof(&format::encode_datablock_prelude(0))?;
        let data_start = self.eof;

        let mut session = WriteSession::default();

        for entry in entries {
            let flags = EntryFlags {
                gzip: entry.gzip.unwrap_or(options.gzip),
                encryption: entry.encryption.unwrap_or(options.encryption),
                hmac: entry.hmac.unwrap_or(options.hmac),
            };
            match entry.source {
                AddSource::Path(path) => {
                    self.add_path_source(&mut session, &path, &options.prefix, &entry.prefix, flags)?
                }
                AddSource::Bytes { key, data, meta } => {
                    let key = join_key(&[&options.prefix, &entry.prefix, &key]);
                    self.stream_entry(&mut session, &key, &mut data.as_slice(), &meta, flags)?;
                }
                AddSource::Reader {
                    key,
                    mut reader,
                    meta,
                } => {
                    let key = join_key(&[&options.prefix, &entry.prefix, &key]);
                    self.stream_entry(&mut session, &key, reader.as_mut(), &meta, flags)?;
                }
                AddSource::Directory { key, meta } => {
                    let key = join_key(&[&options.prefix, &entry.prefix, &key]);
                    validate_key_len(&key)?;
                    session.pending_dirs.push(DirectoryEntry {
                        key,
                        mode: meta.mode,
                        mtime_ms: meta.mtime_ms,
                        atime_ms: meta.atime_ms,
                        encryption: flags.encryption,
                        deleted: false,
                    });
                }
            }
        }

        // The placeholder prelude gets the real payload total.
        let total = self.eof - data_start;
        let total = u32::try_from(total).map_err(|_| offset_overflow())?;
        self.file.seek(SeekFrom::Start(prelude_offset))?;
        self.file
            .write_all(&format::encode_datablock_prelude(total))?;

        let mut result = AddResult {
            bytes_written: total as u64,
            ..AddResult::default()
        };

        for dir in std::mem::take(&mut session.pending_dirs) {
            let key_bytes = self.disk_key(&dir.key, dir.encryption);
            let record = format::encode_directory(&dir, &key_bytes)?;
            self.write_at_eof(&record)?;
            self.insert_directory(dir);
            result.directories_written += 1;
        }

        for entry in std::mem::take(&mut session.pending_index) {
            let key_bytes = self.disk_key(&entry.key, entry.encryption);
            let record = format::encode_index(&entry, &key_bytes)?;
            self.write_at_eof(&record)?;
            self.insert_index(entry);
            result.entries_written += 1;
        }

        Ok(result)
    }

    /// Serializes a key for a record: plaintext, or `IV ‖ ciphertext`
    /// when the entry is encrypted. The in-memory key stays plaintext.
    fn disk_key(&self, key: &str, encrypted: bool) -> Vec<u8> {
        if encrypted {
            crypto::encrypt(key.as_bytes(), &self.key)
        } else {
            key.as_bytes().to_vec()
        }
    }

    fn add_path_source(
        &mut self,
        session: &mut WriteSession,
        path: &Path,
        session_prefix: &str,
        entry_prefix: &str,
        flags: EntryFlags,
    ) -> Result<()> {
        let meta = fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            log::warn!("skipping symlink '{}'", path.display());
            return Ok(());
        }

        let name = basename(path);
        let base_key = join_key(&[session_prefix, entry_prefix, &name]);

        if meta.is_dir() {
            validate_key_len(&base_key)?;
            let (mtime_ms, atime_ms) = timestamp::file_times(&meta);
            session.pending_dirs.push(DirectoryEntry {
                key: base_key.clone(),
                mode: mode_of(&meta),
                mtime_ms,
                atime_ms,
                encryption: flags.encryption,
                deleted: false,
            });

            for item in WalkDir::new(path)
                .min_depth(1)
                .follow_links(false)
                .sort_by_file_name()
            {
                let item = item.map_err(walkdir_error)?;
                if item.file_type().is_symlink() {
                    log::warn!("skipping symlink '{}'", item.path().display());
                    continue;
                }
                let rel = item
                    .path()
                    .strip_prefix(path)
                    .expect("walkdir yields descendants of its root");
                let rel_key = rel.to_string_lossy().replace('\\', "/");
                let key = join_key(&[&base_key, &rel_key]);
                let item_meta = item.metadata().map_err(walkdir_error)?;
                let (mtime_ms, atime_ms) = timestamp::file_times(&item_meta);

                if item.file_type().is_dir() {
                    validate_key_len(&key)?;
                    session.pending_dirs.push(DirectoryEntry {
                        key,
                        mode: mode_of(&item_meta),
                        mtime_ms,
                        atime_ms,
                        encryption: flags.encryption,
                        deleted: false,
                    });
                } else if item.file_type().is_file() {
                    let mut file = File::open(item.path())?;
                    let entry_meta = EntryMeta {
                        mode: mode_of(&item_meta),
                        mtime_ms,
                        atime_ms,
                    };
                    self.stream_entry(session, &key, &mut file, &entry_meta, flags)?;
                }
            }
        } else {
            let (mtime_ms, atime_ms) = timestamp::file_times(&meta);
            let entry_meta = EntryMeta {
                mode: mode_of(&meta),
                mtime_ms,
                atime_ms,
            };
            let mut file = File::open(path)?;
            self.stream_entry(session, &base_key, &mut file, &entry_meta, flags)?;
        }
        Ok(())
    }

    /// Streams one payload through the write pipeline into the archive
    /// at EOF and queues its index record.
    fn stream_entry(
        &mut self,
        session: &mut WriteSession,
        key: &str,
        reader: &mut dyn Read,
        meta: &EntryMeta,
        flags: EntryFlags,
    ) -> Result<()> {
        validate_key_len(key)?;
        let offset = u32::try_from(self.eof).map_err(|_| offset_overflow())?;

        let mut pipeline =
            Pipeline::for_write(flags.gzip, flags.encryption, flags.hmac, &self.key);
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let out = pipeline.update(&buf[..n])?;
            if !out.is_empty() {
                self.write_at_eof(&out)?;
            }
        }
        let tail = pipeline.finish()?;
        if !tail.is_empty() {
            self.write_at_eof(&tail)?;
        }

        let size = u32::try_from(self.eof - offset as u64).map_err(|_| offset_overflow())?;
        session.pending_index.push(IndexEntry {
            key: key.to_string(),
            offset,
            size,
            mode: meta.mode,
            mtime_ms: meta.mtime_ms,
            atime_ms: meta.atime_ms,
            gzip: flags.gzip,
            encryption: flags.encryption,
            hmac: flags.hmac,
            deleted: false,
            poisoned: false,
        });
        Ok(())
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u16 {
    use std::os::unix::fs::MetadataExt;
    (meta.mode() & 0o7777) as u16
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u16 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn walkdir_error(err: walkdir::Error) -> Error {
    let msg = err.to_string();
    Error::Io(
        err.into_io_error()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg)),
    )
}

fn offset_overflow() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        "archive exceeds the 4 GiB offset limit",
    ))
}
