//! Push-based stream transforms.
//!
//! Entry payloads pass through up to three stages on the way into the
//! archive (gzip, cipher, HMAC append) and the mirror stages on the way
//! out (HMAC strip, decipher, gunzip). Each stage consumes chunks of any
//! size and produces chunks; [`Transform::finish`] flushes whatever the
//! stage held back — the gzip trailer, the IV of an empty ciphertext,
//! the HMAC tag.
//!
//! Stages compose left to right through [`Pipeline`]. The write order is
//! `source → gzip? → cipher? → hmac?`; the read order is the reverse:
//! `window → dehmac? → decipher? → gunzip?`.

use std::io::Write;

use ctr::cipher::StreamCipher;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use hmac::Mac;

use crate::crypto::{self, Aes256Ctr, HmacSha256, SecretKey, HMAC_SIZE, IV_SIZE};
use crate::{Error, Result};

/// A push-based pipeline stage: chunks in, chunks out, one final flush.
pub trait Transform {
    /// Feeds a chunk in and returns whatever output it produced.
    fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>>;

    /// Signals end of input and returns any buffered tail.
    fn finish(&mut self) -> Result<Vec<u8>>;
}

/// An ordered chain of transforms.
pub struct Pipeline {
    stages: Vec<Box<dyn Transform>>,
}

impl Pipeline {
    /// Builds a pipeline from stages applied left to right.
    ///
    /// An empty stage list is the identity pipeline.
    pub fn new(stages: Vec<Box<dyn Transform>>) -> Self {
        Self { stages }
    }

    /// Builds the write-side pipeline for the given entry flags.
    pub fn for_write(gzip: bool, encryption: bool, hmac: bool, key: &SecretKey) -> Self {
        let mut stages: Vec<Box<dyn Transform>> = Vec::new();
        if gzip {
            stages.push(Box::new(GzipEncode::new()));
        }
        if encryption {
            stages.push(Box::new(Cipher::new(key)));
        }
        if hmac {
            stages.push(Box::new(HmacAppend::new(key)));
        }
        Self::new(stages)
    }

    /// Builds the read-side pipeline mirroring [`Pipeline::for_write`].
    ///
    /// `verify` puts the HMAC stage into verifying mode; otherwise the
    /// trailing tag is stripped and discarded.
    pub fn for_read(
        gzip: bool,
        encryption: bool,
        hmac: bool,
        verify: bool,
        key: &SecretKey,
    ) -> Self {
        let mut stages: Vec<Box<dyn Transform>> = Vec::new();
        if hmac {
            stages.push(Box::new(HmacStrip::new(key, verify)));
        }
        if encryption {
            stages.push(Box::new(Decipher::new(key)));
        }
        if gzip {
            stages.push(Box::new(GzipDecode::new()));
        }
        Self::new(stages)
    }

    /// Pushes a chunk through every stage in order.
    pub fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let mut data = chunk.to_vec();
        for stage in &mut self.stages {
            data = stage.update(&data)?;
        }
        Ok(data)
    }

    /// Finishes every stage, cascading each stage's tail through the
    /// stages after it.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        let mut carry: Vec<u8> = Vec::new();
        for i in 0..self.stages.len() {
            let mut out = if carry.is_empty() {
                Vec::new()
            } else {
                self.stages[i].update(&carry)?
            };
            out.extend(self.stages[i].finish()?);
            carry = out;
        }
        Ok(carry)
    }
}

/// Gzip compression stage.
pub struct GzipEncode {
    inner: Option<GzEncoder<Vec<u8>>>,
}

impl GzipEncode {
    /// Creates a compression stage at the default level.
    pub fn new() -> Self {
        Self {
            inner: Some(GzEncoder::new(Vec::new(), Compression::default())),
        }
    }
}

impl Default for GzipEncode {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for GzipEncode {
    fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let Some(enc) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        enc.write_all(chunk)?;
        Ok(std::mem::take(enc.get_mut()))
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        match self.inner.take() {
            Some(enc) => Ok(enc.finish()?),
            None => Ok(Vec::new()),
        }
    }
}

/// Gzip decompression stage.
pub struct GzipDecode {
    inner: Option<GzDecoder<Vec<u8>>>,
}

impl GzipDecode {
    /// Creates a decompression stage.
    pub fn new() -> Self {
        Self {
            inner: Some(GzDecoder::new(Vec::new())),
        }
    }
}

impl Default for GzipDecode {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for GzipDecode {
    fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let Some(dec) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        dec.write_all(chunk)?;
        Ok(std::mem::take(dec.get_mut()))
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        match self.inner.take() {
            Some(dec) => Ok(dec.finish()?),
            None => Ok(Vec::new()),
        }
    }
}

/// AES-256-CTR encryption stage.
///
/// Prepends a freshly drawn 16-byte IV to its first output. An entry
/// with no payload still produces the IV from `finish`, so every
/// encrypted window is at least [`IV_SIZE`] bytes.
pub struct Cipher {
    cipher: Aes256Ctr,
    iv: [u8; IV_SIZE],
    iv_sent: bool,
}

impl Cipher {
    /// Creates an encrypting stage with a fresh random IV.
    pub fn new(key: &SecretKey) -> Self {
        let iv = crypto::random_iv();
        Self {
            cipher: crypto::cipher_for(key, &iv),
            iv,
            iv_sent: false,
        }
    }
}

impl Transform for Cipher {
    fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(chunk.len() + IV_SIZE);
        if !self.iv_sent {
            self.iv_sent = true;
            out.extend_from_slice(&self.iv);
        }
        let mut body = chunk.to_vec();
        self.cipher.apply_keystream(&mut body);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        if self.iv_sent {
            Ok(Vec::new())
        } else {
            self.iv_sent = true;
            Ok(self.iv.to_vec())
        }
    }
}

/// AES-256-CTR decryption stage.
///
/// Buffers the first 16 bytes as the IV, tolerating delivery split
/// across any number of chunks. If fewer than 16 bytes ever arrive the
/// stage outputs nothing and completes silently.
pub struct Decipher {
    key: SecretKey,
    iv_buf: Vec<u8>,
    cipher: Option<Aes256Ctr>,
}

impl Decipher {
    /// Creates a decrypting stage; the IV comes from the stream.
    pub fn new(key: &SecretKey) -> Self {
        Self {
            key: key.clone(),
            iv_buf: Vec::with_capacity(IV_SIZE),
            cipher: None,
        }
    }
}

impl Transform for Decipher {
    fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let mut rest = chunk;
        if self.cipher.is_none() {
            let need = IV_SIZE - self.iv_buf.len();
            let take = need.min(rest.len());
            self.iv_buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.iv_buf.len() == IV_SIZE {
                let iv: [u8; IV_SIZE] = self.iv_buf[..]
                    .try_into()
                    .expect("iv_buf is exactly IV_SIZE bytes");
                self.cipher = Some(crypto::cipher_for(&self.key, &iv));
            }
        }
        match self.cipher.as_mut() {
            Some(cipher) if !rest.is_empty() => {
                let mut out = rest.to_vec();
                cipher.apply_keystream(&mut out);
                Ok(out)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        // A short window (no full IV) completes without output.
        Ok(Vec::new())
    }
}

/// HMAC-SHA256 appending stage.
///
/// Passes input through unchanged while updating a running MAC; the
/// 32-byte digest is emitted by `finish`.
pub struct HmacAppend {
    mac: Option<HmacSha256>,
}

impl HmacAppend {
    /// Creates a tag-appending stage.
    pub fn new(key: &SecretKey) -> Self {
        Self {
            mac: Some(crypto::new_mac(key)),
        }
    }
}

impl Transform for HmacAppend {
    fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        if let Some(mac) = self.mac.as_mut() {
            mac.update(chunk);
        }
        Ok(chunk.to_vec())
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        match self.mac.take() {
            Some(mac) => Ok(mac.finalize().into_bytes().to_vec()),
            None => Ok(Vec::new()),
        }
    }
}

/// HMAC-SHA256 stripping stage.
///
/// The final 32 bytes of the window are the tag, but end of input is
/// only known at `finish`, so the stage keeps a rolling 32-byte
/// suspended tail and releases everything before it. In verifying mode
/// a tag mismatch (or a window too short to hold a tag) fails the
/// stream with [`Error::HmacMismatch`]; otherwise the tail is discarded
/// silently.
pub struct HmacStrip {
    mac: Option<HmacSha256>,
    tail: Vec<u8>,
    verify: bool,
}

impl HmacStrip {
    /// Creates a tag-stripping stage, verifying when asked to.
    pub fn new(key: &SecretKey, verify: bool) -> Self {
        Self {
            mac: Some(crypto::new_mac(key)),
            tail: Vec::new(),
            verify,
        }
    }
}

impl Transform for HmacStrip {
    fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.tail.extend_from_slice(chunk);
        if self.tail.len() <= HMAC_SIZE {
            return Ok(Vec::new());
        }
        let cut = self.tail.len() - HMAC_SIZE;
        let released: Vec<u8> = self.tail.drain(..cut).collect();
        if let Some(mac) = self.mac.as_mut() {
            mac.update(&released);
        }
        Ok(released)
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        let Some(mac) = self.mac.take() else {
            return Ok(Vec::new());
        };
        if self.verify {
            if self.tail.len() < HMAC_SIZE {
                return Err(Error::HmacMismatch { entry: None });
            }
            mac.verify_slice(&self.tail)
                .map_err(|_| Error::HmacMismatch { entry: None })?;
        }
        self.tail.clear();
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::new("transform test key")
    }

    fn run(pipeline: &mut Pipeline, input: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in input.chunks(chunk_size.max(1)) {
            out.extend(pipeline.update(chunk)?);
        }
        out.extend(pipeline.finish()?);
        Ok(out)
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let mut p = Pipeline::new(Vec::new());
        assert_eq!(run(&mut p, b"payload", 3).unwrap(), b"payload");
    }

    #[test]
    fn gzip_round_trip() {
        let data = b"gzip me gzip me gzip me gzip me gzip me".repeat(20);
        let mut enc = Pipeline::new(vec![Box::new(GzipEncode::new())]);
        let packed = run(&mut enc, &data, 13).unwrap();
        assert!(packed.len() < data.len());

        let mut dec = Pipeline::new(vec![Box::new(GzipDecode::new())]);
        assert_eq!(run(&mut dec, &packed, 5).unwrap(), data);
    }

    #[test]
    fn cipher_prepends_one_iv() {
        let mut enc = Pipeline::new(vec![Box::new(Cipher::new(&key()))]);
        let out = run(&mut enc, b"abcdefgh", 3).unwrap();
        assert_eq!(out.len(), IV_SIZE + 8);
    }

    #[test]
    fn cipher_of_empty_input_is_just_an_iv() {
        let mut enc = Pipeline::new(vec![Box::new(Cipher::new(&key()))]);
        let out = run(&mut enc, b"", 1).unwrap();
        assert_eq!(out.len(), IV_SIZE);

        let mut dec = Pipeline::new(vec![Box::new(Decipher::new(&key()))]);
        assert!(run(&mut dec, &out, 1).unwrap().is_empty());
    }

    #[test]
    fn decipher_tolerates_split_iv() {
        let mut enc = Pipeline::new(vec![Box::new(Cipher::new(&key()))]);
        let sealed = run(&mut enc, b"split iv delivery", 64).unwrap();

        // Deliver one byte at a time so the IV spans 16 updates.
        let mut dec = Pipeline::new(vec![Box::new(Decipher::new(&key()))]);
        assert_eq!(run(&mut dec, &sealed, 1).unwrap(), b"split iv delivery");
    }

    #[test]
    fn decipher_short_input_outputs_nothing() {
        let mut dec = Pipeline::new(vec![Box::new(Decipher::new(&key()))]);
        assert!(run(&mut dec, &[0u8; 15], 4).unwrap().is_empty());
    }

    #[test]
    fn hmac_append_then_strip_verifies() {
        let data = b"authenticated payload";
        let mut mac_in = Pipeline::new(vec![Box::new(HmacAppend::new(&key()))]);
        let tagged = run(&mut mac_in, data, 6).unwrap();
        assert_eq!(tagged.len(), data.len() + HMAC_SIZE);

        let mut mac_out = Pipeline::new(vec![Box::new(HmacStrip::new(&key(), true))]);
        assert_eq!(run(&mut mac_out, &tagged, 7).unwrap(), data);
    }

    #[test]
    fn hmac_strip_detects_tamper() {
        let mut mac_in = Pipeline::new(vec![Box::new(HmacAppend::new(&key()))]);
        let mut tagged = run(&mut mac_in, b"authenticated payload", 6).unwrap();
        tagged[3] ^= 0x01;

        let mut mac_out = Pipeline::new(vec![Box::new(HmacStrip::new(&key(), true))]);
        let err = run(&mut mac_out, &tagged, 7).unwrap_err();
        assert!(matches!(err, Error::HmacMismatch { .. }));
    }

    #[test]
    fn hmac_strip_without_verify_discards_tail() {
        let mut mac_in = Pipeline::new(vec![Box::new(HmacAppend::new(&key()))]);
        let mut tagged = run(&mut mac_in, b"payload", 3).unwrap();
        tagged[0] ^= 0xff;

        // Wrong data, but verification is off: the tail just vanishes.
        let mut mac_out = Pipeline::new(vec![Box::new(HmacStrip::new(&key(), false))]);
        let out = run(&mut mac_out, &tagged, 3).unwrap();
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn hmac_strip_short_window() {
        // Less than a full tag: nothing released, silent without verify.
        let mut p = Pipeline::new(vec![Box::new(HmacStrip::new(&key(), false))]);
        assert!(run(&mut p, &[0u8; 20], 6).unwrap().is_empty());

        // With verify the short window is a mismatch.
        let mut p = Pipeline::new(vec![Box::new(HmacStrip::new(&key(), true))]);
        let err = run(&mut p, &[0u8; 20], 6).unwrap_err();
        assert!(matches!(err, Error::HmacMismatch { .. }));
    }

    #[test]
    fn hmac_strip_releases_in_small_chunks() {
        let data = [7u8; 40];
        let mut p = Pipeline::new(vec![Box::new(HmacStrip::new(&key(), false))]);
        let mut out = Vec::new();
        for chunk in data.chunks(7) {
            out.extend(p.update(chunk).unwrap());
        }
        out.extend(p.finish().unwrap());
        assert_eq!(out, &data[..8]);
    }

    #[test]
    fn full_write_read_pipeline_round_trip() {
        let data = b"the full stack: gzip, then aes-256-ctr, then hmac-sha256".repeat(50);
        for (gzip, encryption, hmac) in [
            (true, false, false),
            (false, true, false),
            (false, false, true),
            (true, true, false),
            (true, false, true),
            (false, true, true),
            (true, true, true),
        ] {
            let mut w = Pipeline::for_write(gzip, encryption, hmac, &key());
            let packed = run(&mut w, &data, 1000).unwrap();

            let mut r = Pipeline::for_read(gzip, encryption, hmac, true, &key());
            let unpacked = run(&mut r, &packed, 333).unwrap();
            assert_eq!(
                unpacked, data,
                "round trip failed for gzip={gzip} enc={encryption} hmac={hmac}"
            );
        }
    }

    #[test]
    fn encrypted_hmac_window_has_expected_size() {
        // IV(16) + CT(8) + HMAC(32) = 56 bytes.
        let mut w = Pipeline::for_write(false, true, true, &key());
        let packed = run(&mut w, b"abcdefgh", 8).unwrap();
        assert_eq!(packed.len(), 56);
    }

    #[test]
    fn wrong_key_fails_verification() {
        let mut w = Pipeline::for_write(false, true, true, &SecretKey::new("secret"));
        let packed = run(&mut w, b"abcdefgh", 8).unwrap();

        let mut r = Pipeline::for_read(false, true, true, true, &SecretKey::new("wrong"));
        let err = run(&mut r, &packed, 8).unwrap_err();
        assert!(matches!(err, Error::HmacMismatch { .. }));
    }
}
