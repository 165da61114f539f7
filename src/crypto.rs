//! AES-256-CTR and HMAC-SHA256 primitives.
//!
//! The archive uses one symmetric secret for everything: the cipher key
//! is `SHA-256(user key bytes)`, derived unconditionally (the empty key
//! included), and the same 32-byte value keys the HMACs. Every
//! ciphertext carries its own fresh 16-byte IV inline, so CTR keystream
//! reuse cannot occur across entries.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Size of the inline initialization vector in bytes.
pub const IV_SIZE: usize = 16;

/// Size of an HMAC-SHA256 digest in bytes.
pub const HMAC_SIZE: usize = 32;

pub(crate) type Aes256Ctr = ctr::Ctr128BE<Aes256>;
pub(crate) type HmacSha256 = Hmac<Sha256>;

/// A user-supplied encryption key.
///
/// The raw bytes are zeroized on drop and never appear in `Debug`
/// output. An empty key is legal; derivation still applies.
#[derive(Clone)]
pub struct SecretKey {
    inner: Zeroizing<Vec<u8>>,
}

impl Default for SecretKey {
    fn default() -> Self {
        Self {
            inner: Zeroizing::new(Vec::new()),
        }
    }
}

impl SecretKey {
    /// Creates a key from a string.
    pub fn new<S: AsRef<str>>(key: S) -> Self {
        Self::from_bytes(key.as_ref().as_bytes())
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            inner: Zeroizing::new(bytes.to_vec()),
        }
    }

    /// The empty key.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if no key material was supplied.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Derives the 32-byte cipher/MAC key: `SHA-256(key bytes)`.
    pub fn derive(&self) -> [u8; 32] {
        Sha256::digest(&*self.inner).into()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material in debug output.
        f.debug_struct("SecretKey")
            .field("len", &self.inner.len())
            .finish()
    }
}

impl From<&str> for SecretKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SecretKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Draws a fresh 16-byte IV from the operating system CSPRNG.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

pub(crate) fn cipher_for(key: &SecretKey, iv: &[u8; IV_SIZE]) -> Aes256Ctr {
    Aes256Ctr::new(&key.derive().into(), &(*iv).into())
}

pub(crate) fn new_mac(key: &SecretKey) -> HmacSha256 {
    HmacSha256::new_from_slice(&key.derive()).expect("HMAC accepts any key length")
}

/// One-shot encryption: returns `IV ‖ AES-256-CTR(derive(key), IV, plain)`.
pub fn encrypt(plain: &[u8], key: &SecretKey) -> Vec<u8> {
    let iv = random_iv();
    let mut out = Vec::with_capacity(IV_SIZE + plain.len());
    out.extend_from_slice(&iv);
    let mut body = plain.to_vec();
    cipher_for(key, &iv).apply_keystream(&mut body);
    out.extend_from_slice(&body);
    out
}

/// One-shot decryption of `IV ‖ ciphertext`.
///
/// Inputs shorter than one IV decrypt to nothing, mirroring the stream
/// decipher's silent completion on short input.
pub fn decrypt(data: &[u8], key: &SecretKey) -> Vec<u8> {
    if data.len() < IV_SIZE {
        return Vec::new();
    }
    let (iv, body) = data.split_at(IV_SIZE);
    let iv: [u8; IV_SIZE] = iv.try_into().expect("slice is exactly IV_SIZE bytes");
    let mut out = body.to_vec();
    cipher_for(key, &iv).apply_keystream(&mut out);
    out
}

/// Computes the HMAC-SHA256 of `data` under the derived key.
pub fn hmac_digest(data: &[u8], key: &SecretKey) -> [u8; HMAC_SIZE] {
    let mut mac = new_mac(key);
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verifies an HMAC-SHA256 tag in constant time.
pub fn hmac_verify(data: &[u8], tag: &[u8], key: &SecretKey) -> bool {
    let mut mac = new_mac(key);
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}
