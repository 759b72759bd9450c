use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use fieldcrypt_types::KeyId;

use crate::crypto::Algorithm;
use crate::ctx::State;
use crate::testutil::*;

/// Auto-encrypt `value` under a fresh data key and return
/// `(key_doc, encrypted_doc)`.
fn encrypt_one(
    crypt: &std::sync::Arc<crate::crypt::Crypt>,
    value: Bson,
) -> (Document, Document) {
    let (key_id, key_doc) = make_data_key(crypt);
    let mut ctx = crypt
        .ctx()
        .local_schema(schema_stub())
        .encrypt_init("db.coll");
    let marked = doc! {
        "insert": "coll",
        "documents": [{"ssn": marking_value(key_id, Algorithm::Random, None, value)}],
    };
    ctx.mongo_feed_markings(&markings_reply(marked)).unwrap();
    ctx.mongo_done_markings().unwrap();
    if ctx.state() == State::NeedMongoKeys {
        feed_keys(&mut ctx, std::slice::from_ref(&key_doc));
    }
    (key_doc, ctx.finalize().unwrap())
}

#[test]
fn doc_without_blobs_is_ready_immediately() {
    let crypt = test_crypt();
    let original = doc! {"ok": 1, "cursor": {"firstBatch": [{"a": 1}]}};
    let mut ctx = crypt.ctx().decrypt_init(&original);
    assert_eq!(ctx.state(), State::Ready);
    assert_eq!(ctx.finalize().unwrap(), original);
}

#[test]
fn decrypt_round_trips_auto_encrypt() {
    let crypt = test_crypt();
    let value = Bson::String("123-45-6789".into());
    let (key_doc, encrypted) = encrypt_one(&crypt, value.clone());

    let mut ctx = crypt.ctx().decrypt_init(&encrypted);
    if ctx.state() == State::NeedMongoKeys {
        feed_keys(&mut ctx, std::slice::from_ref(&key_doc));
    }
    assert_eq!(ctx.state(), State::Ready);

    let decrypted = ctx.finalize().unwrap();
    let documents = decrypted.get_array("documents").unwrap();
    let ssn = documents[0].as_document().unwrap().get("ssn").unwrap();
    assert_eq!(ssn, &value);
}

#[test]
fn partial_decryption_passes_unknown_keys_through() {
    let crypt = test_crypt();
    let (known_doc, encrypted) = encrypt_one(&crypt, Bson::Int32(11));

    // Splice in a blob for a key the vault will not return.
    let mut stranger_blob = vec![0x02u8];
    stranger_blob.extend_from_slice(&[0xEE; 16]);
    stranger_blob.push(0x10);
    stranger_blob.extend_from_slice(&[0u8; 32]);

    let mut with_stranger = encrypted.clone();
    with_stranger.insert(
        "stray",
        Binary {
            subtype: BinarySubtype::Encrypted,
            bytes: stranger_blob.clone(),
        },
    );

    let mut ctx = crypt.ctx().decrypt_init(&with_stranger);
    assert_eq!(ctx.state(), State::NeedMongoKeys);
    ctx.mongo_op_keys().unwrap();
    ctx.mongo_feed_keys(&known_doc).unwrap();
    // The stranger key was never provided; decryption tolerates that.
    ctx.mongo_done_keys().unwrap();
    assert_eq!(ctx.state(), State::Ready);

    let decrypted = ctx.finalize().unwrap();
    // The known field decrypted, the stray blob is byte-identical.
    let documents = decrypted.get_array("documents").unwrap();
    let ssn = documents[0].as_document().unwrap().get("ssn").unwrap();
    assert_eq!(ssn, &Bson::Int32(11));
    match decrypted.get("stray") {
        Some(Bson::Binary(bin)) => assert_eq!(bin.bytes, stranger_blob),
        other => panic!("expected pass-through binary, got {other:?}"),
    }
}

#[test]
fn explicit_decrypt_round_trip() {
    let crypt = test_crypt();
    let (key_id, key_doc) = make_data_key(&crypt);

    let mut enc = crypt
        .ctx()
        .key_id(key_id)
        .algorithm(Algorithm::Random)
        .explicit_encrypt_init(&doc! {"v": 42});
    feed_keys(&mut enc, std::slice::from_ref(&key_doc));
    let wrapped = enc.finalize().unwrap();

    let mut dec = crypt.ctx().explicit_decrypt_init(&wrapped);
    // Material is already in the shared store from the encrypt context.
    assert_eq!(dec.state(), State::Ready);
    assert_eq!(dec.finalize().unwrap(), doc! {"v": 42});
}

#[test]
fn explicit_decrypt_requires_v() {
    let crypt = test_crypt();
    let ctx = crypt.ctx().explicit_decrypt_init(&doc! {"x": 1});
    assert_eq!(
        ctx.status().unwrap_err().to_string(),
        "invalid msg, must contain 'v'"
    );
}

#[test]
fn explicit_decrypt_requires_binary_v() {
    let crypt = test_crypt();
    let ctx = crypt.ctx().explicit_decrypt_init(&doc! {"v": "plain"});
    assert_eq!(
        ctx.status().unwrap_err().to_string(),
        "invalid msg, 'v' must contain a binary"
    );
}

#[test]
fn explicit_decrypt_rejects_malformed_blob() {
    let crypt = test_crypt();
    let ctx = crypt.ctx().explicit_decrypt_init(&doc! {
        "v": Binary { subtype: BinarySubtype::Encrypted, bytes: vec![0x01; 10] },
    });
    assert_eq!(
        ctx.status().unwrap_err().to_string(),
        "malformed ciphertext, too small"
    );
}

#[test]
fn decrypt_init_rejects_options() {
    let crypt = test_crypt();
    let ctx = crypt
        .ctx()
        .algorithm(Algorithm::Random)
        .decrypt_init(&doc! {});
    assert_eq!(
        ctx.status().unwrap_err().to_string(),
        "algorithm must not be set for decryption"
    );
}

#[test]
fn decrypt_key_order_follows_document_order() {
    let crypt = test_crypt();
    let id_a = KeyId([0xA1; 16]);
    let id_b = KeyId([0xB2; 16]);

    let blob = |id: KeyId| {
        let mut bytes = vec![0x01u8];
        bytes.extend_from_slice(&id.0);
        bytes.push(0x10);
        bytes.extend_from_slice(&[0u8; 32]);
        Binary {
            subtype: BinarySubtype::Encrypted,
            bytes,
        }
    };

    let docm = doc! {
        "first": blob(id_a),
        "nested": {"second": blob(id_b)},
        "repeat": blob(id_a),
    };
    let mut ctx = crypt.ctx().decrypt_init(&docm);
    assert_eq!(ctx.state(), State::NeedMongoKeys);

    let filter = ctx.mongo_op_keys().unwrap();
    let or = filter.get_array("$or").unwrap();
    let ids = or[0].as_document().unwrap()["_id"]
        .as_document()
        .unwrap()
        .get_array("$in")
        .unwrap();
    // Duplicates collapse; traversal order is preserved.
    assert_eq!(
        ids,
        &vec![
            Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: id_a.0.to_vec() }),
            Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: id_b.0.to_vec() }),
        ]
    );
}
