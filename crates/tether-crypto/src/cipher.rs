//! Keyed stream cipher.
//!
//! The connection stream is encrypted with a counter-mode cipher: the same
//! keystream application both encrypts and decrypts, and the stream can be
//! processed in chunks of any size.

use crate::{CryptoError, IV_SIZE, KEY_SIZE};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A stateful keystream applied to a byte stream.
pub trait KeyStream: Send {
    /// XOR the next `data.len()` keystream bytes into `data`.
    fn apply_keystream(&mut self, data: &mut [u8]);
}

/// Key and IV for one direction of a stream.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl CipherKey {
    /// Create a key from raw parts.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self { key, iv }
    }

    /// Create a key with an all-zero IV.
    #[must_use]
    pub fn zero_iv(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key,
            iv: [0u8; IV_SIZE],
        }
    }

    /// Split digest output into a key (first 32 bytes) and an IV (next 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `material` is shorter than
    /// key and IV together.
    pub fn from_digest(material: &[u8]) -> Result<Self, CryptoError> {
        if material.len() < KEY_SIZE + IV_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE + IV_SIZE,
                actual: material.len(),
            });
        }

        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        key.copy_from_slice(&material[..KEY_SIZE]);
        iv.copy_from_slice(&material[KEY_SIZE..KEY_SIZE + IV_SIZE]);
        Ok(Self { key, iv })
    }

    /// Raw key bytes.
    #[must_use]
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Raw IV bytes.
    #[must_use]
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Instantiate the stream cipher at stream position zero.
    #[must_use]
    pub fn keystream(&self) -> Aes256Ctr {
        Aes256Ctr::new(self)
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey").finish_non_exhaustive()
    }
}

/// AES-256 in big-endian 128-bit counter mode.
pub struct Aes256Ctr {
    inner: ctr::Ctr128BE<Aes256>,
}

impl Aes256Ctr {
    /// Create a cipher positioned at the start of the stream.
    #[must_use]
    pub fn new(key: &CipherKey) -> Self {
        Self {
            inner: ctr::Ctr128BE::<Aes256>::new(&key.key.into(), &key.iv.into()),
        }
    }
}

impl KeyStream for Aes256Ctr {
    fn apply_keystream(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}
