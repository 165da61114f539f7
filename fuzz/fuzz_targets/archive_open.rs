//! Fuzz target: opening and loading arbitrary bytes must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

use jpk::{Archive, OpenMode, SecretKey};

fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let path = dir.path().join("fuzz.jpk");
    if std::fs::write(&path, data).is_err() {
        return;
    }

    // Errors are expected constantly; panics are the bug.
    if let Ok(mut archive) = Archive::open(&path, SecretKey::new("fuzz"), OpenMode::Existing) {
        let _ = archive.load(true);
        let _ = archive.load(false);
        let keys: Vec<String> = archive.keys().iter().map(|k| k.to_string()).collect();
        for key in keys {
            let _ = archive.get_buffer(&key, true);
        }
    }
});
