use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A 16-byte key identifier. On the wire this is the UUID stored at offset 1
/// of an encrypted-field blob and the `_id` of a key vault document.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    /// Generate a fresh random key id (UUID v4).
    pub fn random() -> Self {
        KeyId(*Uuid::new_v4().as_bytes())
    }

    /// Construct from a byte slice. Returns `None` unless it is exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(KeyId(arr))
    }

    /// Hex-encode the full key id.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// View as a UUID for display and interop.
    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl From<[u8; 16]> for KeyId {
    fn from(bytes: [u8; 16]) -> Self {
        KeyId(bytes)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.as_uuid())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ() {
        assert_ne!(KeyId::random(), KeyId::random());
    }

    #[test]
    fn from_slice_requires_16_bytes() {
        assert!(KeyId::from_slice(&[0u8; 16]).is_some());
        assert!(KeyId::from_slice(&[0u8; 15]).is_none());
        assert!(KeyId::from_slice(&[0u8; 17]).is_none());
        assert!(KeyId::from_slice(&[]).is_none());
    }

    #[test]
    fn to_hex_length() {
        let id = KeyId([0xAB; 16]);
        assert_eq!(id.to_hex().len(), 32);
        assert_eq!(id.to_hex(), "ab".repeat(16));
    }

    #[test]
    fn display_is_hyphenated_uuid() {
        let id = KeyId([0x11; 16]);
        assert_eq!(id.to_string(), "11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn round_trips_through_uuid() {
        let id = KeyId::random();
        assert_eq!(KeyId(*id.as_uuid().as_bytes()), id);
    }
}
