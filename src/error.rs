//! Error types for JPK archive operations.
//!
//! All fallible operations in this crate return [`Result<T>`], an alias
//! for `std::result::Result<T, Error>`. The [`Error`] enum covers format
//! faults, integrity faults, API misuse and underlying I/O failures.
//!
//! # Error Categories
//!
//! | Category | Variants | Typical cause |
//! |----------|----------|---------------|
//! | I/O | [`Io`][Error::Io] | File system operations |
//! | Format | [`BadMagic`][Error::BadMagic], [`TruncatedRecord`][Error::TruncatedRecord], [`UnknownHeader`][Error::UnknownHeader], [`HeaderTooLarge`][Error::HeaderTooLarge], [`KeyTooLarge`][Error::KeyTooLarge] | Invalid archive data or input |
//! | Security | [`UnsafeKey`][Error::UnsafeKey], [`InvalidPrefix`][Error::InvalidPrefix] | Path traversal defense |
//! | Integrity | [`HmacMissing`][Error::HmacMissing], [`HmacMismatch`][Error::HmacMismatch] | Tampered or corrupted data |
//! | Misuse | [`NotLoaded`][Error::NotLoaded], [`HmacPresent`][Error::HmacPresent], [`AlreadyExists`][Error::AlreadyExists] | Wrong call order or arguments |

use std::io;
use std::path::PathBuf;

/// Helper struct for formatting HmacMismatch error messages.
struct HmacMismatchDisplay<'a> {
    entry: Option<&'a str>,
}

impl std::fmt::Display for HmacMismatchDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HMAC mismatch")?;
        if let Some(entry) = self.entry {
            write!(f, " for entry '{}'", entry)?;
        }
        Ok(())
    }
}

/// The main error type for JPK archive operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred during file operations.
    ///
    /// Wraps [`std::io::Error`]; check the underlying
    /// [`std::io::ErrorKind`] for specific handling.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file does not start with the `JPK` magic bytes.
    #[error("bad magic: expected \"JPK\", found {found:02x?}")]
    BadMagic {
        /// The three bytes actually found at the start of the file.
        found: [u8; 3],
    },

    /// A record could not be fully decoded before end of file.
    ///
    /// Usually the result of a partial write: the archive must be rebuilt.
    #[error("truncated record at offset {offset:#x}")]
    TruncatedRecord {
        /// Byte offset of the record that failed to decode.
        offset: u64,
    },

    /// A header key outside the known registry was passed to `add_header`.
    #[error("unknown header key '{key}'")]
    UnknownHeader {
        /// The rejected key.
        key: String,
    },

    /// A header value exceeds the on-disk value size limit.
    #[error("header value for '{key}' is {size} bytes (limit {limit})")]
    HeaderTooLarge {
        /// The header key.
        key: String,
        /// Size of the offending value.
        size: usize,
        /// The format limit.
        limit: usize,
    },

    /// An entry key exceeds the on-disk key size limit.
    #[error("entry key is {size} bytes (limit {limit})")]
    KeyTooLarge {
        /// UTF-8 length of the offending key.
        size: usize,
        /// The format limit.
        limit: usize,
    },

    /// A prefix is absolute or contains traversal segments.
    #[error("invalid prefix '{prefix}'")]
    InvalidPrefix {
        /// The rejected prefix.
        prefix: String,
    },

    /// An entry key would escape the extraction directory.
    ///
    /// The extractor logs and skips entries with this fault so one bad
    /// key cannot abort a bulk extraction; other callers surface it.
    #[error("unsafe entry key '{key}'")]
    UnsafeKey {
        /// The rejected key.
        key: String,
    },

    /// Verification was requested but the archive has no `metaHmac` header.
    #[error("archive has no metaHmac header")]
    HmacMissing,

    /// An HMAC did not match the authenticated data.
    ///
    /// Raised both for the archive-wide meta HMAC (`entry` is `None`)
    /// and for per-entry payload HMACs. An entry that failed once is
    /// poisoned: every further read of it fails immediately.
    #[error("{}", HmacMismatchDisplay { entry: entry.as_deref() })]
    HmacMismatch {
        /// The entry key, when the failure is per-entry.
        entry: Option<String>,
    },

    /// A `metaHmac` header is already present.
    ///
    /// `add_meta_hmac` refuses to write a second digest; the first one
    /// would silently stop covering the archive.
    #[error("archive already carries a metaHmac header")]
    HmacPresent,

    /// Archive metadata has not been loaded yet.
    #[error("archive metadata not loaded; call load() first")]
    NotLoaded,

    /// `OpenMode::New` was requested but the file already exists.
    #[error("archive already exists: {}", path.display())]
    AlreadyExists {
        /// Path of the pre-existing file.
        path: PathBuf,
    },

    /// An entry key was not found in the archive.
    #[error("entry not found: {key}")]
    EntryNotFound {
        /// The key that was looked up.
        key: String,
    },
}

impl Error {
    /// Returns `true` if this error indicates tampered or corrupted data.
    ///
    /// Integrity errors must be surfaced to the caller; they are never
    /// skippable.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Error::HmacMissing | Error::HmacMismatch { .. })
    }

    /// Returns `true` if this error is a path-safety rejection.
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            Error::UnsafeKey { .. } | Error::InvalidPrefix { .. }
        )
    }

    /// Returns `true` if this error indicates malformed archive data or
    /// oversized input.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Error::BadMagic { .. }
                | Error::TruncatedRecord { .. }
                | Error::UnknownHeader { .. }
                | Error::HeaderTooLarge { .. }
                | Error::KeyTooLarge { .. }
        )
    }

    /// Attaches an entry key to an anonymous `HmacMismatch`.
    pub(crate) fn with_entry(self, key: &str) -> Self {
        match self {
            Error::HmacMismatch { entry: None } => Error::HmacMismatch {
                entry: Some(key.to_string()),
            },
            other => other,
        }
    }
}

/// A specialized Result type for JPK operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn bad_magic_display() {
        let err = Error::BadMagic {
            found: [0x50, 0x4b, 0x03],
        };
        assert!(err.to_string().contains("JPK"));
        assert!(err.is_format_error());
    }

    #[test]
    fn truncated_record_display() {
        let err = Error::TruncatedRecord { offset: 0x30 };
        assert!(err.to_string().contains("0x30"));
        assert!(err.is_format_error());
    }

    #[test]
    fn hmac_mismatch_with_and_without_entry() {
        let err = Error::HmacMismatch { entry: None };
        assert_eq!(err.to_string(), "HMAC mismatch");
        assert!(err.is_integrity_error());

        let err = err.with_entry("secret.txt");
        assert!(err.to_string().contains("secret.txt"));
    }

    #[test]
    fn with_entry_leaves_other_errors_alone() {
        let err = Error::HmacMissing.with_entry("a.txt");
        assert!(matches!(err, Error::HmacMissing));
    }

    #[test]
    fn classification() {
        assert!(Error::UnsafeKey { key: "../x".into() }.is_security_error());
        assert!(Error::InvalidPrefix { prefix: "/a".into() }.is_security_error());
        assert!(Error::HmacMissing.is_integrity_error());
        assert!(!Error::NotLoaded.is_integrity_error());
        assert!(
            Error::KeyTooLarge {
                size: 70000,
                limit: 64512
            }
            .is_format_error()
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
