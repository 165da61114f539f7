//! # jpk
//!
//! A pure-Rust library for reading and writing JPK archive containers.
//!
//! JPK is a single-file, append-friendly container storing named byte
//! streams and directory entries with filesystem metadata. Entry
//! payloads are optionally gzip-compressed, optionally encrypted with
//! AES-256-CTR under a user-supplied key, and optionally authenticated
//! with per-entry HMAC-SHA256. A global HMAC over all metadata records
//! authenticates the index and headers. New entries append as
//! additional datablock + index sections without rewriting existing
//! content.
//!
//! ## Quick Start
//!
//! ### Creating an Archive
//!
//! ```rust,no_run
//! use jpk::{AddEntry, AddOptions, Archive, OpenMode, Result, SecretKey};
//!
//! fn main() -> Result<()> {
//!     let mut archive = Archive::open("data.jpk", SecretKey::empty(), OpenMode::New)?;
//!
//!     let result = archive.add(
//!         vec![
//!             AddEntry::bytes("hello.txt", "hi"),
//!             AddEntry::path("assets"),
//!         ],
//!         &AddOptions {
//!             gzip: true,
//!             ..AddOptions::default()
//!         },
//!     )?;
//!     println!("wrote {} entries", result.entries_written);
//!     Ok(())
//! }
//! ```
//!
//! ### Reading an Archive
//!
//! ```rust,no_run
//! use jpk::{Archive, ExtractOptions, OpenMode, Result, SecretKey};
//!
//! fn main() -> Result<()> {
//!     let mut archive = Archive::open("data.jpk", SecretKey::empty(), OpenMode::Existing)?;
//!     archive.load(false)?;
//!
//!     for key in archive.keys() {
//!         println!("{key}");
//!     }
//!
//!     let _bytes = archive.get_buffer("hello.txt", false)?;
//!
//!     let _report = archive.extract("./output", &ExtractOptions::default())?;
//!     Ok(())
//! }
//! ```
//!
//! ### Encrypted, Authenticated Entries
//!
//! ```rust,no_run
//! use jpk::{AddEntry, AddOptions, Archive, OpenMode, Result, SecretKey};
//!
//! fn main() -> Result<()> {
//!     let key = SecretKey::new("correct horse battery staple");
//!     let mut archive = Archive::open("sealed.jpk", key, OpenMode::New)?;
//!
//!     let _ = archive.add(
//!         vec![AddEntry::bytes("secret.txt", "classified")],
//!         &AddOptions {
//!             encryption: true,
//!             hmac: true,
//!             ..AddOptions::default()
//!         },
//!     )?;
//!
//!     // Seal the metadata too.
//!     archive.add_meta_hmac()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Integrity Model
//!
//! Two independent layers:
//!
//! - **Per-entry HMAC**: the last 32 bytes of an entry's payload window
//!   authenticate everything before them in that window. Verified on
//!   read when requested; a failed entry is poisoned and refuses all
//!   further reads.
//! - **Meta HMAC**: the `metaHmac` header authenticates every header,
//!   index and directory record plus each datablock prelude, in file
//!   order, excluding itself. [`Archive::load`] can verify it in the
//!   same pass that builds the maps.
//!
//! Both layers key HMAC-SHA256 with `SHA-256(user key)`.
//!
//! ## Safety
//!
//! Extraction validates every key against path traversal (`../`,
//! absolute paths, `~`) and skips offenders with a log line instead of
//! writing outside the target directory.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

/// Default buffer size for streaming reads (8 KiB).
pub(crate) const READ_BUFFER_SIZE: usize = 8192;

pub mod archive;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod extract;
pub mod format;
pub mod path;
pub mod timestamp;
pub mod transform;
pub mod write;

pub use archive::{Archive, EntryReader, OpenMode};
pub use crypto::SecretKey;
pub use error::{Error, Result};
pub use extract::{ExtractOptions, ExtractResult};
pub use format::{DirectoryEntry, HeaderValue, IndexEntry};
pub use write::{AddEntry, AddOptions, AddResult, AddSource, EntryMeta};
