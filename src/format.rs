//! On-disk record layouts for the JPK container.
//!
//! A JPK file is the three magic bytes `JPK` followed by records in any
//! order, subject to one rule: every index entry points into a
//! datablock that appears earlier in the file. All multi-byte integers
//! are big-endian.
//!
//! Record layouts (fixed portion includes the leading flags byte):
//!
//! | Record | Fixed | Variable tail |
//! |---|---|---|
//! | Header | `flags(1) keyLen(1) valueLen(2)` = 4 B | key bytes, value bytes |
//! | Index | `flags(1) offset(4) size(4) mode(2) mtime(8f) atime(8f) keyLen(2)` = 29 B | key bytes |
//! | Directory | `flags(1) mode(2) mtime(8f) atime(8f) keyLen(2)` = 21 B | key bytes |
//! | Datablock | `flags(1) size(4)` = 5 B | `size` content bytes |
//!
//! The low two flag bits select the record type; the remaining bits are
//! per-entry options (deleted, gzip, encryption, hmac).

use std::io::{Cursor, Read};

use crate::codec;
use crate::{Error, Result};

/// The three ASCII bytes every JPK file starts with.
pub const MAGIC: [u8; 3] = *b"JPK";

/// Mask selecting the record type from a flags byte.
pub const MASK_TYPE: u8 = 0b0000_0011;

/// Tombstone marker (reserved; tombstoned entries are hidden from
/// listings but still feed the meta HMAC).
pub const FLAG_DELETED: u8 = 1 << 2;

/// Entry payload is gzip-compressed.
pub const FLAG_GZIP: u8 = 1 << 3;

/// Entry payload (and on-disk key) is AES-256-CTR encrypted.
pub const FLAG_ENCRYPTION: u8 = 1 << 5;

/// Entry payload carries a trailing HMAC-SHA256 tag.
pub const FLAG_HMAC: u8 = 1 << 7;

/// Maximum size of a header value on disk.
pub const VALUE_BUFFER_MAX_SIZE: usize = 65536;

/// Raw capacity of the key field in index and directory records.
pub const KEY_BUFFER_MAX_SIZE: usize = 65536;

/// Effective limit on plaintext key length, leaving room for the IV
/// and MAC overhead when the key ships encrypted.
pub const KEY_MAX_SIZE: usize = KEY_BUFFER_MAX_SIZE - 1024;

/// Key of the major format version header (u8).
pub const HEADER_MAJOR_VERSION: &str = "majorVersion";

/// Key of the minor format version header (u8).
pub const HEADER_MINOR_VERSION: &str = "minorVersion";

/// Key of the archive-wide HMAC header (32-byte buffer). Excluded from
/// the digest it stores.
pub const HEADER_META_HMAC: &str = "metaHmac";

/// Format version written into new archives.
pub const MAJOR_VERSION: u8 = 1;
/// Format version written into new archives.
pub const MINOR_VERSION: u8 = 0;

/// Returns true for header keys in the known registry.
pub fn is_known_header(key: &str) -> bool {
    matches!(
        key,
        HEADER_MAJOR_VERSION | HEADER_MINOR_VERSION | HEADER_META_HMAC
    )
}

/// The four record types, encoded in the low two flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Typed key/value metadata.
    Header = 0,
    /// Directory-of-contents entry pointing at a payload window.
    Index = 1,
    /// Prelude + payload bytes.
    Datablock = 2,
    /// Directory entry (no payload).
    Directory = 3,
}

impl RecordType {
    /// Extracts the record type from a flags byte.
    pub fn from_flags(flags: u8) -> Self {
        match flags & MASK_TYPE {
            0 => RecordType::Header,
            1 => RecordType::Index,
            2 => RecordType::Datablock,
            _ => RecordType::Directory,
        }
    }
}

/// A typed header value.
///
/// Known headers decode to their registered type; unknown keys
/// round-trip as opaque byte buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// An unsigned 8-bit integer (the version headers).
    U8(u8),
    /// An opaque byte buffer (`metaHmac` and unknown keys).
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Encodes the value into its wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HeaderValue::U8(v) => vec![*v],
            HeaderValue::Bytes(b) => b.clone(),
        }
    }

    /// Decodes wire bytes according to the key's registered type.
    pub fn decode(key: &str, bytes: &[u8]) -> Self {
        match key {
            HEADER_MAJOR_VERSION | HEADER_MINOR_VERSION if bytes.len() == 1 => {
                HeaderValue::U8(bytes[0])
            }
            _ => HeaderValue::Bytes(bytes.to_vec()),
        }
    }

    /// Returns the integer value, if this is a `U8`.
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            HeaderValue::U8(v) => Some(*v),
            HeaderValue::Bytes(_) => None,
        }
    }

    /// Returns the raw bytes, if this is a `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HeaderValue::U8(_) => None,
            HeaderValue::Bytes(b) => Some(b),
        }
    }
}

/// A directory-of-contents record pointing at a payload window.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Entry key (plaintext, even when the on-disk form is encrypted).
    pub key: String,
    /// Absolute file offset of the payload window.
    pub offset: u32,
    /// Size of the payload window in bytes.
    pub size: u32,
    /// POSIX permission bits.
    pub mode: u16,
    /// Modification time, milliseconds since the Unix epoch.
    pub mtime_ms: f64,
    /// Access time, milliseconds since the Unix epoch.
    pub atime_ms: f64,
    /// Payload is gzip-compressed.
    pub gzip: bool,
    /// Payload and on-disk key are encrypted.
    pub encryption: bool,
    /// Payload carries a trailing HMAC tag.
    pub hmac: bool,
    /// Tombstone marker.
    pub deleted: bool,
    /// Set after a failed HMAC verification; poisoned entries refuse
    /// all further reads.
    pub(crate) poisoned: bool,
}

impl IndexEntry {
    pub(crate) fn flags(&self) -> u8 {
        let mut flags = RecordType::Index as u8;
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        if self.gzip {
            flags |= FLAG_GZIP;
        }
        if self.encryption {
            flags |= FLAG_ENCRYPTION;
        }
        if self.hmac {
            flags |= FLAG_HMAC;
        }
        flags
    }
}

/// A record describing a directory (no payload).
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Directory key (plaintext).
    pub key: String,
    /// POSIX permission bits.
    pub mode: u16,
    /// Modification time, milliseconds since the Unix epoch.
    pub mtime_ms: f64,
    /// Access time, milliseconds since the Unix epoch.
    pub atime_ms: f64,
    /// On-disk key is encrypted.
    pub encryption: bool,
    /// Tombstone marker.
    pub deleted: bool,
}

impl DirectoryEntry {
    pub(crate) fn flags(&self) -> u8 {
        let mut flags = RecordType::Directory as u8;
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        if self.encryption {
            flags |= FLAG_ENCRYPTION;
        }
        flags
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encodes a header record. Header keys are limited to 255 bytes by the
/// one-byte length prefix.
pub(crate) fn encode_header(key: &str, value: &HeaderValue) -> Result<Vec<u8>> {
    let key_bytes = key.as_bytes();
    if key_bytes.len() > u8::MAX as usize {
        return Err(Error::KeyTooLarge {
            size: key_bytes.len(),
            limit: u8::MAX as usize,
        });
    }
    let value_bytes = value.encode();
    if value_bytes.len() >= VALUE_BUFFER_MAX_SIZE {
        return Err(Error::HeaderTooLarge {
            key: key.to_string(),
            size: value_bytes.len(),
            limit: VALUE_BUFFER_MAX_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(4 + key_bytes.len() + value_bytes.len());
    codec::write_u8(&mut buf, RecordType::Header as u8)?;
    codec::write_u8(&mut buf, key_bytes.len() as u8)?;
    codec::write_u16(&mut buf, value_bytes.len() as u16)?;
    buf.extend_from_slice(key_bytes);
    buf.extend_from_slice(&value_bytes);
    Ok(buf)
}

/// Encodes an index record. `key_bytes` is the on-disk key form:
/// plaintext UTF-8, or `IV ‖ ciphertext` when the entry is encrypted.
pub(crate) fn encode_index(entry: &IndexEntry, key_bytes: &[u8]) -> Result<Vec<u8>> {
    if key_bytes.len() >= KEY_BUFFER_MAX_SIZE {
        return Err(Error::KeyTooLarge {
            size: key_bytes.len(),
            limit: KEY_BUFFER_MAX_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(29 + key_bytes.len());
    codec::write_u8(&mut buf, entry.flags())?;
    codec::write_u32(&mut buf, entry.offset)?;
    codec::write_u32(&mut buf, entry.size)?;
    codec::write_u16(&mut buf, entry.mode)?;
    codec::write_f64(&mut buf, entry.mtime_ms)?;
    codec::write_f64(&mut buf, entry.atime_ms)?;
    codec::write_u16(&mut buf, key_bytes.len() as u16)?;
    buf.extend_from_slice(key_bytes);
    Ok(buf)
}

/// Encodes a directory record. The key length prefix is two bytes, like
/// the index record's.
pub(crate) fn encode_directory(entry: &DirectoryEntry, key_bytes: &[u8]) -> Result<Vec<u8>> {
    if key_bytes.len() >= KEY_BUFFER_MAX_SIZE {
        return Err(Error::KeyTooLarge {
            size: key_bytes.len(),
            limit: KEY_BUFFER_MAX_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(21 + key_bytes.len());
    codec::write_u8(&mut buf, entry.flags())?;
    codec::write_u16(&mut buf, entry.mode)?;
    codec::write_f64(&mut buf, entry.mtime_ms)?;
    codec::write_f64(&mut buf, entry.atime_ms)?;
    codec::write_u16(&mut buf, key_bytes.len() as u16)?;
    buf.extend_from_slice(key_bytes);
    Ok(buf)
}

/// Encodes a datablock prelude.
pub(crate) fn encode_datablock_prelude(size: u32) -> [u8; 5] {
    let mut buf = [0u8; 5];
    buf[0] = RecordType::Datablock as u8;
    buf[1..5].copy_from_slice(&size.to_be_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------
//
// The caller has already consumed the flags byte. Each reader returns
// the parsed record together with the raw bytes it consumed, so the
// parser can feed the running meta HMAC without re-encoding.

/// A decoded header record.
pub(crate) struct RawHeader {
    pub key: String,
    pub value: Vec<u8>,
}

pub(crate) fn read_header_record(r: &mut dyn Read) -> Result<(RawHeader, Vec<u8>)> {
    let fixed = codec::read_bytes(r, 3)?;
    let mut cur = Cursor::new(&fixed[..]);
    let key_len = codec::read_u8(&mut cur)? as usize;
    let value_len = codec::read_u16(&mut cur)? as usize;

    let key = codec::read_string(r, key_len)?;
    let value = codec::read_bytes(r, value_len)?;

    let mut raw = fixed;
    raw.extend_from_slice(key.as_bytes());
    raw.extend_from_slice(&value);

    Ok((RawHeader { key, value }, raw))
}

/// A decoded index record whose key is still in on-disk form.
pub(crate) struct RawIndex {
    pub flags: u8,
    pub offset: u32,
    pub size: u32,
    pub mode: u16,
    pub mtime_ms: f64,
    pub atime_ms: f64,
    pub key_bytes: Vec<u8>,
}

pub(crate) fn read_index_record(r: &mut dyn Read, flags: u8) -> Result<(RawIndex, Vec<u8>)> {
    let fixed = codec::read_bytes(r, 28)?;
    let mut cur = Cursor::new(&fixed[..]);
    let offset = codec::read_u32(&mut cur)?;
    let size = codec::read_u32(&mut cur)?;
    let mode = codec::read_u16(&mut cur)?;
    let mtime_ms = codec::read_f64(&mut cur)?;
    let atime_ms = codec::read_f64(&mut cur)?;
    let key_len = codec::read_u16(&mut cur)? as usize;

    let key_bytes = codec::read_bytes(r, key_len)?;
    let mut raw = fixed;
    raw.extend_from_slice(&key_bytes);

    Ok((
        RawIndex {
            flags,
            offset,
            size,
            mode,
            mtime_ms,
            atime_ms,
            key_bytes,
        },
        raw,
    ))
}

/// A decoded directory record whose key is still in on-disk form.
pub(crate) struct RawDirectory {
    pub flags: u8,
    pub mode: u16,
    pub mtime_ms: f64,
    pub atime_ms: f64,
    pub key_bytes: Vec<u8>,
}

pub(crate) fn read_directory_record(r: &mut dyn Read, flags: u8) -> Result<(RawDirectory, Vec<u8>)> {
    let fixed = codec::read_bytes(r, 20)?;
    let mut cur = Cursor::new(&fixed[..]);
    let mode = codec::read_u16(&mut cur)?;
    let mtime_ms = codec::read_f64(&mut cur)?;
    let atime_ms = codec::read_f64(&mut cur)?;
    let key_len = codec::read_u16(&mut cur)? as usize;

    let key_bytes = codec::read_bytes(r, key_len)?;
    let mut raw = fixed;
    raw.extend_from_slice(&key_bytes);

    Ok((
        RawDirectory {
            flags,
            mode,
            mtime_ms,
            atime_ms,
            key_bytes,
        },
        raw,
    ))
}

/// Reads the size field of a datablock prelude. Only these four bytes
/// (plus the flags byte) feed the meta HMAC; the block body never does.
pub(crate) fn read_datablock_size(r: &mut dyn Read) -> Result<(u32, [u8; 4])> {
    let raw = codec::read_exact::<4>(r)?;
    Ok((u32::from_be_bytes(raw), raw))
}
