//! Command implementations for the jpk CLI.

use std::path::{Path, PathBuf};

use jpk::{
    AddEntry, AddOptions, Archive, Error, ExtractOptions, HeaderValue, OpenMode, Result, SecretKey,
};

use crate::exit_codes;

/// Shared write-side configuration assembled in main.
pub struct WriteConfig<'a> {
    pub archive: &'a Path,
    pub files: &'a [PathBuf],
    pub prefix: &'a str,
    pub gzip: bool,
    pub encrypt: bool,
    pub hmac: bool,
    pub meta_hmac: bool,
    pub encryption_key: Option<String>,
}

pub fn create(config: &WriteConfig<'_>) -> i32 {
    report(run_write(config, OpenMode::New))
}

pub fn add(config: &WriteConfig<'_>) -> i32 {
    report(run_write(config, OpenMode::Existing))
}

fn run_write(config: &WriteConfig<'_>, mode: OpenMode) -> Result<()> {
    let key = resolve_key(config.encryption_key.as_deref(), config.encrypt)?;
    let mut archive = Archive::open(config.archive, key, mode)?;
    if mode == OpenMode::New {
        archive.add_core_headers()?;
    }

    let entries: Vec<AddEntry> = config.files.iter().map(|f| AddEntry::path(f)).collect();
    let options = AddOptions {
        prefix: config.prefix.to_string(),
        gzip: config.gzip,
        encryption: config.encrypt,
        hmac: config.hmac,
    };
    let result = archive.add(entries, &options)?;
    println!(
        "{}: {} entries, {} directories, {} payload bytes",
        config.archive.display(),
        result.entries_written,
        result.directories_written,
        result.bytes_written
    );

    if config.meta_hmac {
        archive.add_meta_hmac()?;
        println!("meta HMAC written");
    }
    Ok(())
}

pub fn extract(
    archive: &Path,
    output: &Path,
    verify: bool,
    encryption_key: Option<String>,
) -> i32 {
    report((|| -> Result<()> {
        let key = key_or_empty(encryption_key.as_deref());
        let mut archive = Archive::open(archive, key, OpenMode::Existing)?;
        archive.load(verify)?;

        let result = archive.extract(output, &ExtractOptions { verify_hmac: verify })?;
        println!(
            "{} entries extracted, {} directories applied, {} bytes",
            result.entries_extracted, result.directories_applied, result.bytes_extracted
        );
        if result.entries_skipped > 0 {
            eprintln!("warning: {} unsafe keys skipped", result.entries_skipped);
        }
        Ok(())
    })())
}

pub fn list(
    archive: &Path,
    verify: bool,
    encryption_key: Option<String>,
    directories: bool,
    technical: bool,
) -> i32 {
    report((|| -> Result<()> {
        let key = key_or_empty(encryption_key.as_deref());
        let mut archive = Archive::open(archive, key, OpenMode::Existing)?;
        archive.load(verify)?;

        if directories {
            for dir in archive.directories() {
                if technical {
                    println!("{}/  mode={:o}", dir.key, dir.mode);
                } else {
                    println!("{}/", dir.key);
                }
            }
        }
        for entry in archive.entries() {
            if technical {
                println!(
                    "{}  off={} size={} mode={:o}{}{}{}",
                    entry.key,
                    entry.offset,
                    entry.size,
                    entry.mode,
                    if entry.gzip { " gzip" } else { "" },
                    if entry.encryption { " enc" } else { "" },
                    if entry.hmac { " hmac" } else { "" },
                );
            } else {
                println!("{}", entry.key);
            }
        }
        Ok(())
    })())
}

pub fn list_headers(archive: &Path) -> i32 {
    report((|| -> Result<()> {
        let mut archive = Archive::open(archive, SecretKey::empty(), OpenMode::Existing)?;
        archive.load(false)?;
        for (key, value) in archive.headers() {
            match value {
                HeaderValue::U8(v) => println!("{key} = {v}"),
                HeaderValue::Bytes(b) => println!("{key} = {}", hex(b)),
            }
        }
        Ok(())
    })())
}

/// Resolves the encryption key: the flag value if given, a prompt when
/// encryption is requested without one, the empty key otherwise.
fn resolve_key(flag: Option<&str>, encrypting: bool) -> Result<SecretKey> {
    match flag {
        Some(k) => Ok(SecretKey::new(k)),
        None if encrypting => {
            let prompted = rpassword::prompt_password("Encryption key: ").map_err(Error::Io)?;
            Ok(SecretKey::new(prompted))
        }
        None => Ok(SecretKey::empty()),
    }
}

fn key_or_empty(flag: Option<&str>) -> SecretKey {
    flag.map(SecretKey::new).unwrap_or_else(SecretKey::empty)
}

fn report(result: Result<()>) -> i32 {
    match result {
        Ok(()) => exit_codes::SUCCESS,
        Err(err) => {
            eprintln!("jpk: {err}");
            exit_codes::for_error(&err)
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
