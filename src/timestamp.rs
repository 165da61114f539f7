//! Millisecond timestamp handling.
//!
//! Entry mtime/atime values are stored on disk as IEEE-754 doubles
//! holding milliseconds since the Unix epoch. A double represents every
//! integer millisecond exactly until well past the year 275000, so the
//! format's precision guarantee is one millisecond.

use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;

/// Milliseconds per second.
const MILLIS_PER_SEC: f64 = 1000.0;

/// Nanoseconds per millisecond.
const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Returns the current time in milliseconds since the Unix epoch.
pub fn now_ms() -> f64 {
    from_system_time(SystemTime::now())
}

/// Converts a [`SystemTime`] to milliseconds since the Unix epoch.
///
/// Times before the epoch come out negative.
pub fn from_system_time(t: SystemTime) -> f64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64() * MILLIS_PER_SEC,
        Err(e) => -(e.duration().as_secs_f64() * MILLIS_PER_SEC),
    }
}

/// Converts milliseconds since the Unix epoch to a [`FileTime`] for
/// `utimes`-style calls, truncating below one millisecond.
pub fn to_file_time(ms: f64) -> FileTime {
    let secs = (ms / MILLIS_PER_SEC).floor();
    let rem_ms = ms - secs * MILLIS_PER_SEC;
    let nanos = (rem_ms * NANOS_PER_MILLI).round() as u32;
    // Guard the carry when rem_ms rounds up to a full second.
    if nanos >= 1_000_000_000 {
        FileTime::from_unix_time(secs as i64 + 1, 0)
    } else {
        FileTime::from_unix_time(secs as i64, nanos)
    }
}

/// Converts a [`FileTime`] to milliseconds since the Unix epoch.
pub fn from_file_time(ft: FileTime) -> f64 {
    ft.unix_seconds() as f64 * MILLIS_PER_SEC + ft.nanoseconds() as f64 / NANOS_PER_MILLI
}

/// Extracts (mtime, atime) in milliseconds from filesystem metadata.
pub fn file_times(meta: &Metadata) -> (f64, f64) {
    let mtime = FileTime::from_last_modification_time(meta);
    let atime = FileTime::from_last_access_time(meta);
    (from_file_time(mtime), from_file_time(atime))
}
