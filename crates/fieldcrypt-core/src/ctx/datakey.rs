//! Create-data-key context: generate fresh key material and wrap it with the
//! configured master key, either locally or through one KMS encrypt trip.

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Document};
use fieldcrypt_types::KeyId;
use rand::RngCore;

use super::{Ctx, CtxKind, State};
use crate::crypto::DATA_KEY_LEN;
use crate::error::{Error, Result};
use crate::kms::{aws_endpoint, KmsCtx, KmsRequestKind};
use crate::options::{MasterKeyOpt, OptReq, OptsSpec};

pub(crate) struct DataKeyState {
    pub key_id: KeyId,
    pub masterkey: Option<MasterKeyOpt>,
    pub kms: Option<KmsCtx>,
    pub kms_returned: bool,
    pub encrypted_material: Option<Vec<u8>>,
    pub key_doc: Option<Document>,
}

impl Default for DataKeyState {
    fn default() -> Self {
        Self {
            key_id: KeyId::random(),
            masterkey: None,
            kms: None,
            kms_returned: false,
            encrypted_material: None,
            key_doc: None,
        }
    }
}

impl DataKeyState {
    pub(crate) fn next_kms_ctx(&mut self) -> Option<&mut KmsCtx> {
        if self.kms_returned {
            return None;
        }
        self.kms_returned = true;
        self.kms.as_mut()
    }

    pub(crate) fn finish_kms(&mut self) -> Result<()> {
        let kms = self
            .kms
            .as_mut()
            .ok_or_else(|| Error::KeyBroker("no KMS trip outstanding".into()))?;
        if !kms.done() {
            return Err(Error::KeyBroker("KMS reply not complete".into()));
        }
        self.encrypted_material = Some(kms.take_reply()?);
        Ok(())
    }
}

impl Ctx {
    fn datakey_state(&mut self) -> &mut DataKeyState {
        match &mut self.kind {
            CtxKind::DataKey(dk) => dk,
            _ => unreachable!("datakey step on non-datakey context"),
        }
    }

    pub(crate) fn datakey_init_inner(&mut self) -> Result<()> {
        let spec = OptsSpec {
            masterkey: OptReq::Required,
            ..OptsSpec::prohibit_all()
        };
        spec.validate(&self.opts, "data key creation")?;
        let masterkey = self
            .opts
            .masterkey
            .clone()
            .ok_or_else(|| Error::ClientInput("masterkey required for data key creation".into()))?;

        let mut material = vec![0u8; DATA_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut material);

        match &masterkey {
            MasterKeyOpt::Local => {
                let local_key = self.crypt.providers.local_key.clone().ok_or_else(|| {
                    Error::ClientInput("local kms provider is not configured".into())
                })?;
                let wrapped = self.crypt.engine.encrypt(&local_key, None, &material)?;
                let dk = self.datakey_state();
                dk.masterkey = Some(masterkey);
                dk.encrypted_material = Some(wrapped);
                self.state = State::Ready;
            }
            MasterKeyOpt::Aws { region, cmk } => {
                let kms = KmsCtx::new(
                    KmsRequestKind::Encrypt,
                    aws_endpoint(region),
                    Some(cmk.clone()),
                    material,
                );
                let dk = self.datakey_state();
                dk.masterkey = Some(masterkey);
                dk.kms = Some(kms);
                self.state = State::NeedKms;
            }
        }
        Ok(())
    }

    pub(crate) fn datakey_finalize(&mut self) -> Result<Document> {
        let dk = self.datakey_state();
        let encrypted = dk
            .encrypted_material
            .as_ref()
            .ok_or_else(|| Error::KeyBroker("no wrapped key material".into()))?;

        let master_key = match dk.masterkey.as_ref() {
            Some(MasterKeyOpt::Local) => doc! {"provider": "local"},
            Some(MasterKeyOpt::Aws { region, cmk }) => {
                doc! {"provider": "aws", "region": region, "key": cmk}
            }
            None => {
                return Err(Error::ClientInput(
                    "masterkey required for data key creation".into(),
                ))
            }
        };

        let now = bson::DateTime::now();
        let key_doc = doc! {
            "_id": Binary {
                subtype: BinarySubtype::Uuid,
                bytes: dk.key_id.0.to_vec(),
            },
            "keyMaterial": Binary {
                subtype: BinarySubtype::Generic,
                bytes: encrypted.clone(),
            },
            "creationDate": now,
            "updateDate": now,
            "status": 0i32,
            "masterKey": master_key,
        };
        dk.key_doc = Some(key_doc.clone());
        Ok(key_doc)
    }
}
