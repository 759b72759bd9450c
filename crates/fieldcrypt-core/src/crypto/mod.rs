pub mod aes_gcm;

pub use aes_gcm::Aes256GcmEngine;

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Length of a caller-supplied initialization vector.
pub const IV_LEN: usize = 16;

/// Length of the plaintext key material produced by create-data-key.
pub const DATA_KEY_LEN: usize = 96;

/// Minimum key material length an engine will accept (AES-256 key).
pub const MIN_KEY_LEN: usize = 32;

/// Decrypted key material. Zeroized on drop so key bytes do not linger
/// in freed memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    // Never print key bytes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.bytes.len())
    }
}

/// Field-level encryption algorithm selector. The numeric values are the
/// `a` field of a marking payload and the blob subtype of a ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Algorithm {
    Deterministic = 1,
    Random = 2,
}

impl Algorithm {
    pub fn from_i32(v: i32) -> Result<Self> {
        match v {
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Random),
            _ => Err(Error::MalformedMarking(format!("unsupported algorithm {v}"))),
        }
    }

    pub fn blob_subtype(self) -> u8 {
        self as u8
    }
}

/// Trait for the raw authenticated-encryption primitive.
///
/// The core never performs crypto itself; it hands key material, an optional
/// IV, and plaintext to an engine. A caller IV makes the operation
/// deterministic (same key + iv + plaintext produce the same bytes); without
/// one the engine generates randomness itself.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext under `key`. The returned buffer is self-contained:
    /// `decrypt` needs only the key and these bytes.
    fn encrypt(&self, key: &KeyMaterial, iv: Option<&[u8; IV_LEN]>, plaintext: &[u8])
        -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`.
    fn decrypt(&self, key: &KeyMaterial, data: &[u8]) -> Result<Vec<u8>>;

    /// Generate a fresh random IV.
    fn random_iv(&self) -> [u8; IV_LEN];
}
