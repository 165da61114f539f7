//! Exit codes for the CLI tool.

use jpk::Error;

/// Operation completed.
pub const SUCCESS: i32 = 0;
/// Generic fatal error.
pub const FATAL_ERROR: i32 = 1;
/// Archive format error.
pub const BAD_ARCHIVE: i32 = 2;
/// HMAC verification failure.
pub const INTEGRITY_FAILURE: i32 = 3;
/// I/O error.
pub const IO_ERROR: i32 = 4;

/// Maps an error to its exit code.
pub fn for_error(err: &Error) -> i32 {
    if err.is_integrity_error() {
        INTEGRITY_FAILURE
    } else if err.is_format_error() {
        BAD_ARCHIVE
    } else if matches!(err, Error::Io(_)) {
        IO_ERROR
    } else {
        FATAL_ERROR
    }
}
