//! Decrypt-context steps: key collection from embedded blobs and the
//! finalize pass that rewrites ciphertext back into plaintext values.

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};

use super::{Ctx, CtxKind};
use crate::bson_util;
use crate::ciphertext::Ciphertext;
use crate::crypto::CryptoEngine;
use crate::error::{Error, Result};
use crate::key_broker::KeyBroker;
use crate::options::OptsSpec;
use crate::traverse::{self, TraverseMatch};

#[derive(Default)]
pub(crate) struct DecryptState {
    pub explicit: bool,
    pub original_doc: Document,
    /// The raw blob bytes unwrapped from `{"v": <binary>}` (explicit only).
    pub unwrapped_doc: Option<Vec<u8>>,
    pub decrypted_doc: Option<Document>,
}

impl Ctx {
    fn decrypt_state(&mut self) -> &mut DecryptState {
        match &mut self.kind {
            CtxKind::Decrypt(dst) => dst,
            _ => unreachable!("decrypt step on non-decrypt context"),
        }
    }

    // -- init ---------------------------------------------------------------

    pub(crate) fn decrypt_init_inner(&mut self, doc: &Document) -> Result<()> {
        OptsSpec::prohibit_all().validate(&self.opts, "decryption")?;

        let kb = &mut self.kb;
        traverse::collect(doc, TraverseMatch::Ciphertext, &mut |blob| {
            let ciphertext = Ciphertext::parse(blob)?;
            kb.add_id(ciphertext.key_id)
        })?;

        let dst = self.decrypt_state();
        dst.explicit = false;
        dst.original_doc = doc.clone();

        self.state_from_key_broker()
    }

    pub(crate) fn explicit_decrypt_init_inner(&mut self, msg: &Document) -> Result<()> {
        OptsSpec::prohibit_all().validate(&self.opts, "decryption")?;

        // Round-tripped from explicit encrypt: {"v": <subtype-6 binary>}.
        let value = msg
            .get("v")
            .ok_or_else(|| Error::ClientInput("invalid msg, must contain 'v'".into()))?;
        let blob = match value {
            Bson::Binary(bin) => bin.bytes.clone(),
            _ => {
                return Err(Error::ClientInput(
                    "invalid msg, 'v' must contain a binary".into(),
                ))
            }
        };

        let ciphertext = Ciphertext::parse(&blob)?;
        self.kb.add_id(ciphertext.key_id)?;

        let dst = self.decrypt_state();
        dst.explicit = true;
        dst.original_doc = msg.clone();
        dst.unwrapped_doc = Some(blob);

        self.state_from_key_broker()
    }

    // -- finalize -----------------------------------------------------------

    pub(crate) fn decrypt_finalize(&mut self) -> Result<Document> {
        let Ctx {
            kind, kb, crypt, ..
        } = self;
        let dst = match kind {
            CtxKind::Decrypt(dst) => dst,
            _ => unreachable!("decrypt step on non-decrypt context"),
        };
        let engine = crypt.engine.as_ref();

        let out = if dst.explicit {
            let blob = dst
                .unwrapped_doc
                .as_ref()
                .ok_or_else(|| Error::ClientInput("invalid msg, must contain 'v'".into()))?;
            match decrypt_blob(kb, engine, blob)? {
                Some(value) => doc! {"v": value},
                // Key not available: hand the blob back unchanged.
                None => doc! {"v": Bson::Binary(Binary {
                    subtype: BinarySubtype::Encrypted,
                    bytes: blob.clone(),
                })},
            }
        } else {
            traverse::transform(&dst.original_doc, TraverseMatch::Ciphertext, &mut |blob| {
                decrypt_blob(kb, engine, blob)
            })?
        };

        dst.decrypted_doc = Some(out.clone());
        Ok(out)
    }
}

/// Decrypt one blob to its original BSON value. A key the broker does not
/// hold is not an error: the caller leaves the element untouched and
/// continues (partial decryption).
fn decrypt_blob(
    kb: &KeyBroker,
    engine: &dyn CryptoEngine,
    blob: &[u8],
) -> Result<Option<Bson>> {
    let ciphertext = Ciphertext::parse(blob)?;

    let Some(material) = kb.decrypted_key_by_id(&ciphertext.key_id) else {
        return Ok(None);
    };

    let plaintext = engine.decrypt(&material, ciphertext.ciphertext)?;
    let value = bson_util::raw_to_value(ciphertext.original_bson_type, &plaintext)?;
    Ok(Some(value))
}
