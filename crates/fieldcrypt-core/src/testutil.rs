use std::sync::Arc;

use bson::{doc, Bson, Document};
use fieldcrypt_types::KeyId;

use crate::crypt::{Crypt, CryptConfig};
use crate::crypto::{Algorithm, IV_LEN};
use crate::ctx::{Ctx, State};
use crate::marking::{KeyRef, Marking};

pub const LOCAL_KMS_KEY: [u8; 96] = [0x4B; 96];

pub fn test_crypt() -> Arc<Crypt> {
    Crypt::new(CryptConfig {
        local_kms_key: Some(LOCAL_KMS_KEY.to_vec()),
        cache_noblock: false,
    })
    .unwrap()
}

pub fn test_crypt_noblock() -> Arc<Crypt> {
    Crypt::new(CryptConfig {
        local_kms_key: Some(LOCAL_KMS_KEY.to_vec()),
        cache_noblock: true,
    })
    .unwrap()
}

/// Create a local-provider data key and return its id and key vault document.
pub fn make_data_key(crypt: &Arc<Crypt>) -> (KeyId, Document) {
    let mut ctx = crypt.ctx().masterkey_local().datakey_init();
    assert_eq!(ctx.state(), State::Ready, "status: {:?}", ctx.status());
    let key_doc = ctx.finalize().unwrap();

    let bytes = match key_doc.get("_id") {
        Some(Bson::Binary(bin)) => bin.bytes.clone(),
        other => panic!("unexpected _id: {other:?}"),
    };
    (KeyId::from_slice(&bytes).unwrap(), key_doc)
}

/// A subtype-6 marking binary for `value`, keyed by id.
pub fn marking_value(key_id: KeyId, algorithm: Algorithm, iv: Option<[u8; IV_LEN]>, value: Bson) -> Bson {
    let marking = Marking {
        key: KeyRef::Id(key_id),
        algorithm,
        iv,
        value,
    };
    Bson::Binary(marking.to_binary().unwrap())
}

/// A subtype-6 marking binary for `value`, keyed by alt name.
pub fn marking_value_by_name(
    name: &str,
    algorithm: Algorithm,
    iv: Option<[u8; IV_LEN]>,
    value: Bson,
) -> Bson {
    let marking = Marking {
        key: KeyRef::AltName(name.to_string()),
        algorithm,
        iv,
        value,
    };
    Bson::Binary(marking.to_binary().unwrap())
}

/// A query-analysis reply wrapping the marked command.
pub fn markings_reply(marked: Document) -> Document {
    doc! {
        "schemaRequiresEncryption": true,
        "hasEncryptedPlaceholders": true,
        "result": marked,
    }
}

pub fn schema_stub() -> Document {
    doc! {
        "bsonType": "object",
        "properties": {"ssn": {"encrypt": {}}},
    }
}

/// A listCollections reply advertising `schema` as the collection validator.
pub fn collinfo_with_schema(coll: &str, schema: Document) -> Document {
    doc! {
        "name": coll,
        "type": "collection",
        "options": {"validator": {"$jsonSchema": schema}},
    }
}

/// Drive the key vault step with the given documents.
pub fn feed_keys(ctx: &mut Ctx, key_docs: &[Document]) {
    assert_eq!(ctx.state(), State::NeedMongoKeys, "status: {:?}", ctx.status());
    ctx.mongo_op_keys().unwrap();
    for key_doc in key_docs {
        ctx.mongo_feed_keys(key_doc).unwrap();
    }
    ctx.mongo_done_keys().unwrap();
}
