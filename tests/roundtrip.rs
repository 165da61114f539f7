//! Round-trip integration tests.
//!
//! Covers the literal byte-level scenarios of the format (empty
//! archive, the 48-byte single-entry file, the 56-byte encrypted
//! window) plus round-trips across every pipeline flag combination and
//! append ordering across reopen.

mod common;

use std::io::Read;

use jpk::{AddEntry, AddOptions, Archive, Error, OpenMode, SecretKey};
use tempfile::tempdir;

#[test]
fn empty_archive_is_three_magic_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    Archive::open(&path, SecretKey::empty(), OpenMode::New).unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"JPK");

    let archive = common::reopen(&path, &SecretKey::empty()).unwrap();
    assert!(archive.keys().is_empty());
    assert!(archive.directory_keys().is_empty());
}

#[test]
fn single_plain_entry_has_exact_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    common::create_archive(
        &path,
        &SecretKey::empty(),
        &[("hello.txt", b"hi")],
        &AddOptions::default(),
    )
    .unwrap();

    // magic(3) + datablock prelude(5) + data(2) + index fixed(29) + key(9)
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 48);

    let mut archive = common::reopen(&path, &SecretKey::empty()).unwrap();
    assert_eq!(archive.keys(), vec!["hello.txt"]);
    let meta = archive.get_meta("hello.txt").unwrap().unwrap();
    assert_eq!(meta.offset, 8);
    assert_eq!(meta.size, 2);
    assert_eq!(meta.mode, 0o644);
    assert_eq!(archive.get_buffer("hello.txt", false).unwrap(), b"hi");
}

#[test]
fn gzip_entry_stores_compressed_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    let options = AddOptions {
        gzip: true,
        ..AddOptions::default()
    };
    common::create_archive(&path, &SecretKey::empty(), &[("hello.txt", b"hi")], &options).unwrap();

    let mut archive = common::reopen(&path, &SecretKey::empty()).unwrap();
    let meta = archive.get_meta("hello.txt").unwrap().unwrap();
    assert!(meta.gzip);
    assert_eq!(meta.size as usize, common::gzip_reference(b"hi").len());
    assert_eq!(archive.get_buffer("hello.txt", false).unwrap(), b"hi");
}

#[test]
fn encrypted_hmac_entry_window_is_iv_ct_tag() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    let key = SecretKey::new("secret");
    let options = AddOptions {
        encryption: true,
        hmac: true,
        ..AddOptions::default()
    };
    common::create_archive(&path, &key, &[("data.bin", b"abcdefgh")], &options).unwrap();

    let mut archive = common::reopen(&path, &key).unwrap();
    let meta = archive.get_meta("data.bin").unwrap().unwrap();
    // IV(16) + CT(8) + HMAC(32)
    assert_eq!(meta.size, 56);
    assert_eq!(archive.get_buffer("data.bin", true).unwrap(), b"abcdefgh");
}

#[test]
fn wrong_key_fails_hmac_verification() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    let options = AddOptions {
        encryption: true,
        hmac: true,
        ..AddOptions::default()
    };
    common::create_archive(
        &path,
        &SecretKey::new("secret"),
        &[("data.bin", b"abcdefgh")],
        &options,
    )
    .unwrap();

    let mut archive = common::reopen(&path, &SecretKey::new("wrong")).unwrap();
    let err = archive.get_buffer("data.bin", true).unwrap_err();
    assert!(matches!(err, Error::HmacMismatch { .. }));
}

#[test]
fn encrypted_keys_recover_with_the_right_key() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    let key = SecretKey::new("key key key");
    let options = AddOptions {
        encryption: true,
        ..AddOptions::default()
    };
    common::create_archive(
        &path,
        &key,
        &[("plain/name.txt", b"payload")],
        &options,
    )
    .unwrap();

    // The plaintext key never appears in the file.
    let raw = std::fs::read(&path).unwrap();
    let needle = b"plain/name.txt";
    assert!(
        !raw.windows(needle.len()).any(|w| w == needle),
        "encrypted key leaked to disk"
    );

    let mut archive = common::reopen(&path, &key).unwrap();
    assert_eq!(archive.keys(), vec!["plain/name.txt"]);
    assert_eq!(archive.get_buffer("plain/name.txt", false).unwrap(), b"payload");

    // A wrong key garbles the listing but never panics.
    let garbled = common::reopen(&path, &SecretKey::new("nope")).unwrap();
    assert_eq!(garbled.keys().len(), 1);
    assert_ne!(garbled.keys(), vec!["plain/name.txt"]);
}

#[test]
fn all_flag_combinations_round_trip() {
    let content = b"flag matrix content: not too short, compresses a little bit bit bit";
    let user_key = SecretKey::new("matrix");

    for gzip in [false, true] {
        for encryption in [false, true] {
            for hmac in [false, true] {
                let dir = tempdir().unwrap();
                let path = dir.path().join("m.jpk");
                let options = AddOptions {
                    gzip,
                    encryption,
                    hmac,
                    ..AddOptions::default()
                };
                common::create_archive(&path, &user_key, &[("m.bin", content)], &options).unwrap();

                let mut archive = common::reopen(&path, &user_key).unwrap();
                assert_eq!(
                    archive.get_buffer("m.bin", hmac).unwrap(),
                    content,
                    "buffer mismatch for gzip={gzip} enc={encryption} hmac={hmac}"
                );

                // The streaming path must agree with the one-shot path.
                let mut streamed = Vec::new();
                archive
                    .get_stream("m.bin")
                    .unwrap()
                    .read_to_end(&mut streamed)
                    .unwrap();
                assert_eq!(
                    streamed, content,
                    "stream mismatch for gzip={gzip} enc={encryption} hmac={hmac}"
                );
            }
        }
    }
}

#[test]
fn large_entry_streams_through_many_chunks() {
    // Spans many 8 KiB pipeline chunks with all stages on.
    let content: Vec<u8> = (0u32..60_000).flat_map(|i| i.to_le_bytes()).collect();
    let user_key = SecretKey::new("bulk");

    let dir = tempdir().unwrap();
    let path = dir.path().join("big.jpk");
    let options = AddOptions {
        gzip: true,
        encryption: true,
        hmac: true,
        ..AddOptions::default()
    };
    common::create_archive(&path, &user_key, &[("big.bin", &content)], &options).unwrap();

    let mut archive = common::reopen(&path, &user_key).unwrap();
    assert_eq!(archive.get_buffer("big.bin", true).unwrap(), content);
}

#[test]
fn append_preserves_order_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");

    let mut archive = common::create_archive(
        &path,
        &SecretKey::empty(),
        &[("first.txt", b"1" as &[u8]), ("second.txt", b"2")],
        &AddOptions::default(),
    )
    .unwrap();
    let _ = archive
        .add(
            vec![
                AddEntry::bytes("third.txt", "3"),
                AddEntry::bytes("fourth.txt", "4"),
            ],
            &AddOptions::default(),
        )
        .unwrap();

    let expected = vec!["first.txt", "second.txt", "third.txt", "fourth.txt"];
    assert_eq!(archive.keys(), expected);

    // Reopening walks all datablock + index groupings and reproduces
    // the same order.
    let mut reopened = common::reopen(&path, &SecretKey::empty()).unwrap();
    assert_eq!(reopened.keys(), expected);
    for (key, content) in [("first.txt", "1"), ("fourth.txt", "4")] {
        assert_eq!(
            reopened.get_buffer(key, false).unwrap(),
            content.as_bytes()
        );
    }
}

#[test]
fn magic_survives_writes_and_headers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    let mut archive = Archive::open(&path, SecretKey::empty(), OpenMode::New).unwrap();
    archive.add_core_headers().unwrap();
    let _ = archive
        .add(
            vec![AddEntry::bytes("x", "y")],
            &AddOptions::default(),
        )
        .unwrap();
    archive.add_meta_hmac().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[0..3], b"JPK");
}

#[test]
fn has_and_get_meta_agree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    common::create_archive(
        &path,
        &SecretKey::empty(),
        &[("present.txt", b"x")],
        &AddOptions::default(),
    )
    .unwrap();

    let archive = common::reopen(&path, &SecretKey::empty()).unwrap();
    assert!(archive.has("present.txt"));
    assert!(!archive.has("absent.txt"));
    assert!(archive.get_meta("present.txt").unwrap().is_some());
    assert!(archive.get_meta("absent.txt").unwrap().is_none());
}

#[test]
fn get_buffer_unknown_key_is_not_found() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.jpk");
    common::create_archive(
        &path,
        &SecretKey::empty(),
        &[("a.txt", b"x")],
        &AddOptions::default(),
    )
    .unwrap();

    let mut archive = common::reopen(&path, &SecretKey::empty()).unwrap();
    let err = archive.get_buffer("missing.txt", false).unwrap_err();
    assert!(matches!(err, Error::EntryNotFound { .. }));
}
