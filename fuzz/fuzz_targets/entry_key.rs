//! Fuzz target: key and prefix validation must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

use jpk::path::{join_key, validate_extract_key, validate_prefix};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = validate_extract_key(s);
        let _ = validate_prefix(s);
        if let Some((a, b)) = s.split_once('/') {
            let joined = join_key(&[a, b]);
            let _ = validate_extract_key(&joined);
        }
    }
});
