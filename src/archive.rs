//! Archive open, parse and read API.
//!
//! An [`Archive`] wraps one JPK file. Opening checks the magic and
//! records the end-of-file offset, which is the authoritative write
//! pointer for every append. [`Archive::load`] walks the file record by
//! record, skipping datablock bodies by their declared size, and builds
//! the index and directory maps in file order. The same walk feeds the
//! meta HMAC, so verification and loading are a single pass.
//!
//! A single `Archive` is not safe for concurrent operations: callers
//! must serialize mutating calls and must not interleave them with
//! readers that rely on a stable end-of-file offset. Readers returned
//! by [`Archive::get_stream`] own their file handle and pipeline, so
//! multiple of them may be consumed concurrently while no writer runs.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hmac::Mac;
use subtle::ConstantTimeEq;

use crate::codec;
use crate::crypto::{self, SecretKey, HMAC_SIZE};
use crate::format::{
    self, DirectoryEntry, HeaderValue, IndexEntry, RecordType, FLAG_DELETED, FLAG_ENCRYPTION,
    FLAG_GZIP, FLAG_HMAC, HEADER_MAJOR_VERSION, HEADER_META_HMAC, HEADER_MINOR_VERSION, MAGIC,
    MAJOR_VERSION, MINOR_VERSION,
};
use crate::transform::Pipeline;
use crate::{Error, Result, READ_BUFFER_SIZE};

/// How [`Archive::open`] treats the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// The file must not exist; it is created with the magic bytes.
    New,
    /// The file must exist and start with the magic bytes.
    Existing,
}

/// An open JPK archive.
#[derive(Debug)]
pub struct Archive {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    /// End-of-file offset; the authoritative write pointer.
    pub(crate) eof: u64,
    pub(crate) is_new: bool,
    pub(crate) loaded: bool,
    core_headers_written: bool,
    pub(crate) key: SecretKey,
    headers: Vec<(String, HeaderValue)>,
    pub(crate) entries: Vec<IndexEntry>,
    pub(crate) index_by_key: HashMap<String, usize>,
    pub(crate) dirs: Vec<DirectoryEntry>,
    pub(crate) dirs_by_key: HashMap<String, usize>,
    /// Digest from the most recent HMAC-computing walk.
    meta_hmac: Option<[u8; HMAC_SIZE]>,
}

impl Archive {
    /// Opens or creates an archive file.
    ///
    /// With [`OpenMode::New`] the file is created and seeded with the
    /// `JPK` magic; an existing file fails [`Error::AlreadyExists`].
    /// With [`OpenMode::Existing`] the magic is checked and the
    /// end-of-file offset recorded; metadata is not loaded until
    /// [`Archive::load`].
    pub fn open(path: impl AsRef<Path>, key: SecretKey, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match mode {
            OpenMode::New => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|e| {
                        if e.kind() == io::ErrorKind::AlreadyExists {
                            Error::AlreadyExists { path: path.clone() }
                        } else {
                            Error::Io(e)
                        }
                    })?;
                file.write_all(&MAGIC)?;
                Ok(Self::with_file(path, file, MAGIC.len() as u64, true, true, key))
            }
            OpenMode::Existing => {
                let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
                let eof = file.metadata()?.len();

                let mut found = [0u8; 3];
                let mut filled = 0;
                while filled < found.len() {
                    let n = file.read(&mut found[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled < found.len() || found != MAGIC {
                    return Err(Error::BadMagic { found });
                }

                Ok(Self::with_file(path, file, eof, false, false, key))
            }
        }
    }

    fn with_file(
        path: PathBuf,
        file: File,
        eof: u64,
        is_new: bool,
        loaded: bool,
        key: SecretKey,
    ) -> Self {
        Self {
            path,
            file,
            eof,
            is_new,
            loaded,
            core_headers_written: false,
            key,
            headers: Vec::new(),
            entries: Vec::new(),
            index_by_key: HashMap::new(),
            dirs: Vec::new(),
            dirs_by_key: HashMap::new(),
            meta_hmac: None,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current end-of-file offset.
    pub fn eof(&self) -> u64 {
        self.eof
    }

    /// True when the archive was created by this `open` call.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// True once metadata has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    // -----------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------

    /// Loads archive metadata, optionally verifying the meta HMAC.
    ///
    /// # Errors
    ///
    /// With `verify` set, fails [`Error::HmacMissing`] when the archive
    /// has no `metaHmac` header and [`Error::HmacMismatch`] when the
    /// recomputed digest differs from the stored one.
    pub fn load(&mut self, verify: bool) -> Result<()> {
        self.parse_meta(true, verify)?;
        if verify {
            self.check_meta_digest()?;
        }
        Ok(())
    }

    /// Recomputes the meta HMAC by walking every record in file order.
    ///
    /// Headers, index and directory records contribute their full wire
    /// bytes; datablocks contribute only their 5-byte prelude. The
    /// `metaHmac` header itself never contributes.
    pub fn compute_meta_hmac(&mut self) -> Result<[u8; HMAC_SIZE]> {
        self.parse_meta(false, true)?;
        Ok(self
            .meta_hmac
            .expect("HMAC-computing walk always leaves a digest"))
    }

    /// Verifies the stored `metaHmac` header against a fresh walk.
    pub fn verify_meta_hmac(&mut self) -> Result<()> {
        if !self.loaded {
            self.parse_meta(true, false)?;
        }
        self.compute_meta_hmac()?;
        self.check_meta_digest()
    }

    fn check_meta_digest(&self) -> Result<()> {
        let stored = match self.header(HEADER_META_HMAC) {
            Some(HeaderValue::Bytes(bytes)) => bytes.as_slice(),
            _ => return Err(Error::HmacMissing),
        };
        let computed = self.meta_hmac.ok_or(Error::HmacMissing)?;
        if bool::from(computed[..].ct_eq(stored)) {
            Ok(())
        } else {
            Err(Error::HmacMismatch { entry: None })
        }
    }

    /// Single-pass walk over all records from offset 3 to EOF.
    fn parse_meta(&mut self, load_meta: bool, compute_hmac: bool) -> Result<()> {
        if load_meta {
            self.headers.clear();
            self.entries.clear();
            self.index_by_key.clear();
            self.dirs.clear();
            self.dirs_by_key.clear();
        }
        let mut mac = compute_hmac.then(|| crypto::new_mac(&self.key));

        let mut pos = MAGIC.len() as u64;
        self.file.seek(SeekFrom::Start(pos))?;

        while pos < self.eof {
            let record_start = pos;
            let flags =
                codec::read_u8(&mut self.file).map_err(|e| truncated(e, record_start))?;

            match RecordType::from_flags(flags) {
                RecordType::Header => {
                    let (header, raw) = format::read_header_record(&mut self.file)
                        .map_err(|e| truncated(e, record_start))?;
                    pos += 1 + raw.len() as u64;
                    if header.key != HEADER_META_HMAC {
                        if let Some(mac) = mac.as_mut() {
                            mac.update(&[flags]);
                            mac.update(&raw);
                        }
                    }
                    if load_meta {
                        let value = HeaderValue::decode(&header.key, &header.value);
                        self.set_header(header.key, value);
                    }
                }
                RecordType::Index => {
                    let (rec, raw) = format::read_index_record(&mut self.file, flags)
                        .map_err(|e| truncated(e, record_start))?;
                    pos += 1 + raw.len() as u64;
                    if let Some(mac) = mac.as_mut() {
                        mac.update(&[flags]);
                        mac.update(&raw);
                    }
                    if load_meta {
                        let key = self.decode_key(&rec.key_bytes, flags & FLAG_ENCRYPTION != 0);
                        self.insert_index(IndexEntry {
                            key,
                            offset: rec.offset,
                            size: rec.size,
                            mode: rec.mode,
                            mtime_ms: rec.mtime_ms,
                            atime_ms: rec.atime_ms,
                            gzip: flags & FLAG_GZIP != 0,
                            encryption: flags & FLAG_ENCRYPTION != 0,
                            hmac: flags & FLAG_HMAC != 0,
                            deleted: flags & FLAG_DELETED != 0,
                            poisoned: false,
                        });
                    }
                }
                RecordType::Directory => {
                    let (rec, raw) = format::read_directory_record(&mut self.file, flags)
                        .map_err(|e| truncated(e, record_start))?;
                    pos += 1 + raw.len() as u64;
                    if let Some(mac) = mac.as_mut() {
                        mac.update(&[flags]);
                        mac.update(&raw);
                    }
                    if load_meta {
                        let key = self.decode_key(&rec.key_bytes, flags & FLAG_ENCRYPTION != 0);
                        self.insert_directory(DirectoryEntry {
                            key,
                            mode: rec.mode,
                            mtime_ms: rec.mtime_ms,
                            atime_ms: rec.atime_ms,
                            encryption: flags & FLAG_ENCRYPTION != 0,
                            deleted: flags & FLAG_DELETED != 0,
                        });
                    }
                }
                RecordType::Datablock => {
                    let (size, raw) = format::read_datablock_size(&mut self.file)
                        .map_err(|e| truncated(e, record_start))?;
                    if let Some(mac) = mac.as_mut() {
                        mac.update(&[flags]);
                        mac.update(&raw);
                    }
                    // Skip the body; its bytes never feed the meta HMAC.
                    pos += 5 + size as u64;
                    if pos > self.eof {
                        return Err(Error::TruncatedRecord {
                            offset: record_start,
                        });
                    }
                    self.file.seek(SeekFrom::Start(pos))?;
                }
            }
        }

        if load_meta {
            self.loaded = true;
        }
        if let Some(mac) = mac {
            self.meta_hmac = Some(mac.finalize().into_bytes().into());
        }
        Ok(())
    }

    /// Recovers the plaintext key from its on-disk form.
    ///
    /// Decryption with a wrong user key yields garbage; the lossy UTF-8
    /// conversion keeps that a garbled listing rather than a crash.
    fn decode_key(&self, key_bytes: &[u8], encrypted: bool) -> String {
        if encrypted {
            let plain = crypto::decrypt(key_bytes, &self.key);
            String::from_utf8_lossy(&plain).into_owned()
        } else {
            String::from_utf8_lossy(key_bytes).into_owned()
        }
    }

    pub(crate) fn insert_index(&mut self, entry: IndexEntry) {
        match self.index_by_key.get(&entry.key) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index_by_key.insert(entry.key.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub(crate) fn insert_directory(&mut self, entry: DirectoryEntry) {
        match self.dirs_by_key.get(&entry.key) {
            Some(&i) => self.dirs[i] = entry,
            None => {
                self.dirs_by_key.insert(entry.key.clone(), self.dirs.len());
                self.dirs.push(entry);
            }
        }
    }

    fn set_header(&mut self, key: String, value: HeaderValue) {
        match self.headers.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    // -----------------------------------------------------------------
    // Writing headers
    // -----------------------------------------------------------------

    /// Appends a header record.
    ///
    /// The key must be in the known registry. On the first call for a
    /// new archive the core version headers are written first.
    pub fn add_header(&mut self, key: &str, value: HeaderValue) -> Result<()> {
        if !format::is_known_header(key) {
            return Err(Error::UnknownHeader {
                key: key.to_string(),
            });
        }
        self.add_core_headers()?;
        self.add_header_inner(key, value)
    }

    /// Writes the `majorVersion`/`minorVersion` headers once for a new
    /// archive. Idempotent; a no-op for existing archives.
    pub fn add_core_headers(&mut self) -> Result<()> {
        if !self.is_new
            || self.core_headers_written
            || self.header(HEADER_MAJOR_VERSION).is_some()
        {
            return Ok(());
        }
        self.core_headers_written = true;
        self.add_header_inner(HEADER_MAJOR_VERSION, HeaderValue::U8(MAJOR_VERSION))?;
        self.add_header_inner(HEADER_MINOR_VERSION, HeaderValue::U8(MINOR_VERSION))?;
        Ok(())
    }

    /// Computes and appends the `metaHmac` header.
    ///
    /// The header is excluded from the digest it stores, so later walks
    /// reproduce the same value.
    ///
    /// # Errors
    ///
    /// Fails [`Error::HmacPresent`] if the archive already carries one;
    /// a second digest would silently stop covering the records written
    /// in between.
    pub fn add_meta_hmac(&mut self) -> Result<()> {
        if !self.loaded {
            self.parse_meta(true, false)?;
        }
        if self.header(HEADER_META_HMAC).is_some() {
            return Err(Error::HmacPresent);
        }
        let digest = self.compute_meta_hmac()?;
        self.add_header_inner(HEADER_META_HMAC, HeaderValue::Bytes(digest.to_vec()))
    }

    fn add_header_inner(&mut self, key: &str, value: HeaderValue) -> Result<()> {
        let record = format::encode_header(key, &value)?;
        self.write_at_eof(&record)?;
        self.set_header(key.to_string(), value);
        Ok(())
    }

    /// Appends raw bytes at the EOF pointer and advances it.
    pub(crate) fn write_at_eof(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.eof))?;
        self.file.write_all(bytes)?;
        self.eof += bytes.len() as u64;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------

    /// Returns a header value by key.
    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Iterates headers in insertion order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True if a live (non-tombstoned) entry exists under `key`.
    pub fn has(&self, key: &str) -> bool {
        self.index_by_key
            .get(key)
            .is_some_and(|&i| !self.entries[i].deleted)
    }

    /// Entry keys in insertion order, tombstones hidden.
    pub fn keys(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.key.as_str())
            .collect()
    }

    /// Directory keys in insertion order, tombstones hidden.
    pub fn directory_keys(&self) -> Vec<&str> {
        self.dirs
            .iter()
            .filter(|d| !d.deleted)
            .map(|d| d.key.as_str())
            .collect()
    }

    /// Directory entries in insertion order, tombstones hidden.
    pub fn directories(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.dirs.iter().filter(|d| !d.deleted)
    }

    /// Entries in insertion order, tombstones hidden.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter().filter(|e| !e.deleted)
    }

    /// Looks up an entry's metadata.
    ///
    /// # Errors
    ///
    /// Fails [`Error::NotLoaded`] before [`Archive::load`].
    pub fn get_meta(&self, key: &str) -> Result<Option<&IndexEntry>> {
        if !self.loaded {
            return Err(Error::NotLoaded);
        }
        Ok(self
            .index_by_key
            .get(key)
            .map(|&i| &self.entries[i])
            .filter(|e| !e.deleted))
    }

    fn live_entry_index(&self, key: &str) -> Result<usize> {
        if !self.loaded {
            return Err(Error::NotLoaded);
        }
        let idx = *self
            .index_by_key
            .get(key)
            .ok_or_else(|| Error::EntryNotFound {
                key: key.to_string(),
            })?;
        if self.entries[idx].deleted {
            return Err(Error::EntryNotFound {
                key: key.to_string(),
            });
        }
        if self.entries[idx].poisoned {
            return Err(Error::HmacMismatch {
                entry: Some(key.to_string()),
            });
        }
        Ok(idx)
    }

    /// Reads and decodes a whole entry into memory.
    ///
    /// The window passes through dehmac → decipher → gunzip exactly
    /// once, as the entry's flags dictate. With `verify` set, an entry
    /// carrying an HMAC is checked; a mismatch poisons the entry so all
    /// further reads of it fail immediately.
    pub fn get_buffer(&mut self, key: &str, verify: bool) -> Result<Vec<u8>> {
        let idx = self.live_entry_index(key)?;
        let entry = self.entries[idx].clone();

        let mut window = vec![0u8; entry.size as usize];
        self.file.seek(SeekFrom::Start(entry.offset as u64))?;
        self.file.read_exact(&mut window)?;

        let mut pipeline =
            Pipeline::for_read(entry.gzip, entry.encryption, entry.hmac, verify, &self.key);
        let decoded = (|| -> Result<Vec<u8>> {
            let mut out = pipeline.update(&window)?;
            out.extend(pipeline.finish()?);
            Ok(out)
        })();

        match decoded {
            Ok(data) => Ok(data),
            Err(err @ Error::HmacMismatch { .. }) => {
                self.entries[idx].poisoned = true;
                Err(err.with_entry(key))
            }
            Err(err) => Err(err),
        }
    }

    /// Opens a streaming reader over an entry's decoded bytes.
    ///
    /// The reader owns its own file handle and pipeline, so several may
    /// be consumed concurrently while no writer is active.
    pub fn get_stream(&mut self, key: &str) -> Result<EntryReader> {
        self.entry_reader(key, false)
    }

    pub(crate) fn entry_reader(&mut self, key: &str, verify: bool) -> Result<EntryReader> {
        let idx = self.live_entry_index(key)?;
        let entry = &self.entries[idx];

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset as u64))?;

        Ok(EntryReader {
            file,
            remaining: entry.size as u64,
            pipeline: Pipeline::for_read(
                entry.gzip,
                entry.encryption,
                entry.hmac,
                verify,
                &self.key,
            ),
            buf: Vec::new(),
            buf_pos: 0,
            finished: false,
        })
    }

    pub(crate) fn mark_poisoned(&mut self, key: &str) {
        if let Some(&i) = self.index_by_key.get(key) {
            self.entries[i].poisoned = true;
        }
    }
}

fn truncated(err: Error, offset: u64) -> Error {
    match err {
        Error::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
            ) =>
        {
            Error::TruncatedRecord { offset }
        }
        other => other,
    }
}

/// A pull reader over one entry's decoded plaintext bytes.
///
/// Bridges the push-based transform pipeline to [`std::io::Read`]:
/// window chunks are pushed through the pipeline and buffered until the
/// consumer drains them.
pub struct EntryReader {
    file: File,
    remaining: u64,
    pipeline: Pipeline,
    buf: Vec<u8>,
    buf_pos: usize,
    finished: bool,
}

impl std::fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

impl Read for EntryReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.buf_pos < self.buf.len() {
                let available = &self.buf[self.buf_pos..];
                let n = available.len().min(out.len());
                out[..n].copy_from_slice(&available[..n]);
                self.buf_pos += n;
                if self.buf_pos == self.buf.len() {
                    self.buf.clear();
                    self.buf_pos = 0;
                }
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }

            if self.remaining == 0 {
                self.buf = self.pipeline.finish().map_err(into_io)?;
                self.buf_pos = 0;
                self.finished = true;
                continue;
            }

            let chunk_len = (READ_BUFFER_SIZE as u64).min(self.remaining) as usize;
            let mut chunk = vec![0u8; chunk_len];
            self.file.read_exact(&mut chunk)?;
            self.remaining -= chunk_len as u64;
            self.buf = self.pipeline.update(&chunk).map_err(into_io)?;
            self.buf_pos = 0;
        }
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
