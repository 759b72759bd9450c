use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use fieldcrypt_types::KeyId;

use crate::bson_util;
use crate::crypto::{Algorithm, IV_LEN};
use crate::error::{Error, Result};

/// Discriminator byte prefixed to a marking payload inside a subtype-6 binary.
pub const MARKING_DISCRIMINATOR: u8 = 0;

/// How a marking names its encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyRef {
    Id(KeyId),
    AltName(String),
}

/// A placeholder emitted by query analysis: which value to encrypt, with
/// which key and algorithm. Payload document shape:
/// `{ki: <UUID binary>, a: <i32>, iv?: <16-byte binary>, v: <any>}` or
/// `{ka: <string>, a: <i32>, iv?: <16-byte binary>, v: <any>}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Marking {
    pub key: KeyRef,
    pub algorithm: Algorithm,
    pub iv: Option<[u8; IV_LEN]>,
    pub value: Bson,
}

impl Marking {
    /// Parse a marking payload (the bytes after the discriminator byte).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let doc = Document::from_reader(payload)
            .map_err(|e| Error::MalformedMarking(format!("payload is not a document: {e}")))?;
        Self::from_document(&doc)
    }

    fn from_document(doc: &Document) -> Result<Self> {
        let key_id = match doc.get("ki") {
            Some(Bson::Binary(bin)) if bin.subtype == BinarySubtype::Uuid => {
                Some(KeyId::from_slice(&bin.bytes).ok_or_else(|| {
                    Error::MalformedMarking("key id must be a 16-byte UUID".into())
                })?)
            }
            Some(_) => {
                return Err(Error::MalformedMarking(
                    "key id must be a UUID binary".into(),
                ))
            }
            None => None,
        };

        let alt_name = match doc.get("ka") {
            Some(Bson::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(Error::MalformedMarking(
                    "key alt name must be a string".into(),
                ))
            }
            None => None,
        };

        let key = match (key_id, alt_name) {
            (Some(id), None) => KeyRef::Id(id),
            (None, Some(name)) => KeyRef::AltName(name),
            (Some(_), Some(_)) => {
                return Err(Error::MalformedMarking(
                    "cannot have both key id and key alt name".into(),
                ))
            }
            (None, None) => {
                return Err(Error::MalformedMarking("no key id or key alt name".into()))
            }
        };

        let algorithm = match doc.get("a") {
            Some(a) => {
                let v = a
                    .as_i32()
                    .or_else(|| a.as_i64().and_then(|v| i32::try_from(v).ok()))
                    .ok_or_else(|| Error::MalformedMarking("algorithm must be an int".into()))?;
                Algorithm::from_i32(v)?
            }
            None => return Err(Error::MalformedMarking("no algorithm".into())),
        };

        let iv = match doc.get("iv") {
            Some(Bson::Binary(bin)) => {
                let arr: [u8; IV_LEN] = bin.bytes.as_slice().try_into().map_err(|_| {
                    Error::MalformedMarking(format!("iv must be {IV_LEN} bytes"))
                })?;
                Some(arr)
            }
            Some(_) => return Err(Error::MalformedMarking("iv must be a binary".into())),
            None => None,
        };

        let value = doc
            .get("v")
            .cloned()
            .ok_or_else(|| Error::MalformedMarking("no 'v'".into()))?;

        Ok(Marking {
            key,
            algorithm,
            iv,
            value,
        })
    }

    /// Serialize into the payload document. Inverse of [`Marking::parse`].
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let mut doc = Document::new();
        match &self.key {
            KeyRef::Id(id) => {
                doc.insert(
                    "ki",
                    Binary {
                        subtype: BinarySubtype::Uuid,
                        bytes: id.0.to_vec(),
                    },
                );
            }
            KeyRef::AltName(name) => {
                doc.insert("ka", name.clone());
            }
        }
        doc.insert("a", self.algorithm as i32);
        if let Some(iv) = &self.iv {
            doc.insert(
                "iv",
                Binary {
                    subtype: BinarySubtype::Generic,
                    bytes: iv.to_vec(),
                },
            );
        }
        doc.insert("v", self.value.clone());
        bson_util::doc_to_bytes(&doc)
    }

    /// Wrap this marking into the subtype-6 binary the traversal matches on:
    /// a zero discriminator byte followed by the payload document.
    pub fn to_binary(&self) -> Result<Binary> {
        let payload = self.to_payload()?;
        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(MARKING_DISCRIMINATOR);
        bytes.extend_from_slice(&payload);
        Ok(Binary {
            subtype: BinarySubtype::Encrypted,
            bytes,
        })
    }
}
