use fieldcrypt_types::KeyId;

use crate::error::{Error, Result};

/// Minimum serialized length: subtype (1) + key uuid (16) + original bson
/// type (1) + at least one ciphertext byte.
pub const MIN_CIPHERTEXT_LEN: usize = 19;

/// A parsed encrypted-field blob (the payload of a subtype-6 binary).
///
/// Wire format:
/// ```text
/// offset 0  : u8      blob_subtype (1 = deterministic, 2 = random)
/// offset 1  : u8[16]  key_uuid
/// offset 17 : u8      original_bson_type
/// offset 18 : u8[]    ciphertext
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext<'a> {
    pub blob_subtype: u8,
    pub key_id: KeyId,
    pub original_bson_type: u8,
    pub ciphertext: &'a [u8],
}

impl<'a> Ciphertext<'a> {
    /// Parse a blob. The ciphertext payload is borrowed from the input; the
    /// key id is copied out.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < MIN_CIPHERTEXT_LEN {
            return Err(Error::MalformedCiphertext("too small".into()));
        }

        let blob_subtype = bytes[0];
        if blob_subtype != 1 && blob_subtype != 2 {
            return Err(Error::MalformedCiphertext(
                "expected blob subtype of 1 or 2".into(),
            ));
        }

        let key_id = KeyId::from_slice(&bytes[1..17])
            .expect("slice is exactly 16 bytes");

        Ok(Ciphertext {
            blob_subtype,
            key_id,
            original_bson_type: bytes[17],
            ciphertext: &bytes[18..],
        })
    }

    /// Serialize back to the wire layout above.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.ciphertext.len());
        out.push(self.blob_subtype);
        out.extend_from_slice(&self.key_id.0);
        out.push(self.original_bson_type);
        out.extend_from_slice(self.ciphertext);
        out
    }
}
