use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use super::{CryptoEngine, KeyMaterial, IV_LEN, MIN_KEY_LEN};
use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM authenticated encryption engine.
///
/// Wire format: `[12-byte nonce][ciphertext + 16-byte tag]`. The nonce is the
/// leading 96 bits of the 16-byte IV; the cipher key is the leading 32 bytes
/// of the key material (data keys carry 96 bytes, only the head is the
/// encryption key).
pub struct Aes256GcmEngine;

impl Aes256GcmEngine {
    fn cipher(key: &KeyMaterial) -> Result<Aes256Gcm> {
        if key.len() < MIN_KEY_LEN {
            return Err(Error::Crypto(format!(
                "key material too short: {} bytes, need at least {MIN_KEY_LEN}",
                key.len()
            )));
        }
        Aes256Gcm::new_from_slice(&key.bytes()[..MIN_KEY_LEN])
            .map_err(|e| Error::Crypto(format!("cipher init: {e}")))
    }
}

impl CryptoEngine for Aes256GcmEngine {
    fn encrypt(
        &self,
        key: &KeyMaterial,
        iv: Option<&[u8; IV_LEN]>,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let cipher = Self::cipher(key)?;
        let iv = match iv {
            Some(iv) => *iv,
            None => self.random_iv(),
        };
        let nonce = Nonce::from_slice(&iv[..NONCE_LEN]);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Crypto(format!("AES-GCM encrypt: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&iv[..NONCE_LEN]);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &KeyMaterial, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto("ciphertext too short".into()));
        }
        let cipher = Self::cipher(key)?;
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Crypto("decryption failed: wrong key or corrupted data".into()))
    }

    fn random_iv(&self) -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        iv
    }
}
