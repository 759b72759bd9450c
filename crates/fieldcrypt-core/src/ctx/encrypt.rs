//! Encrypt-context steps: collinfo, markings, and the finalize pass that
//! rewrites markings into ciphertext blobs.

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use fieldcrypt_types::Namespace;

use super::{Ctx, CtxKind, State};
use crate::bson_util;
use crate::ciphertext::Ciphertext;
use crate::collinfo::{CachePairState, CollinfoLookup};
use crate::crypto::{Algorithm, CryptoEngine};
use crate::error::{Error, Result};
use crate::key_broker::KeyBroker;
use crate::marking::{KeyRef, Marking};
use crate::options::{OptReq, OptsSpec};
use crate::traverse::{self, TraverseMatch};

pub(crate) struct EncryptState {
    pub explicit: bool,
    pub ns: Option<Namespace>,
    pub schema: Option<Document>,
    /// The caller's `{"v": ...}` message (explicit only).
    pub original_cmd: Option<Document>,
    /// The query-analysis result containing markings.
    pub marked_cmd: Option<Document>,
    pub encrypted_cmd: Option<Document>,
    /// Query analysis reported nothing to encrypt.
    pub markings_skipped: bool,
    pub collinfo_state: CachePairState,
    pub collinfo_owner: u32,
    pub waiting_for_collinfo: bool,
}

impl Default for EncryptState {
    fn default() -> Self {
        Self {
            explicit: false,
            ns: None,
            schema: None,
            original_cmd: None,
            marked_cmd: None,
            encrypted_cmd: None,
            markings_skipped: false,
            collinfo_state: CachePairState::Pending,
            collinfo_owner: 0,
            waiting_for_collinfo: false,
        }
    }
}

impl Ctx {
    fn encrypt_state(&mut self) -> &mut EncryptState {
        match &mut self.kind {
            CtxKind::Encrypt(est) => est,
            _ => unreachable!("encrypt step on non-encrypt context"),
        }
    }

    pub(crate) fn encrypt_ns(&self) -> Result<Namespace> {
        match &self.kind {
            CtxKind::Encrypt(est) => est
                .ns
                .clone()
                .ok_or_else(|| Error::ClientInput("context has no namespace".into())),
            _ => Err(Error::ClientInput(
                "collection info not applicable to this context type".into(),
            )),
        }
    }

    // -- init ---------------------------------------------------------------

    pub(crate) fn encrypt_init_inner(&mut self, ns: &str) -> Result<()> {
        let spec = OptsSpec {
            schema: OptReq::Optional,
            ..OptsSpec::prohibit_all()
        };
        spec.validate(&self.opts, "auto encryption")?;

        let ns = Namespace::parse(ns)
            .ok_or_else(|| Error::ClientInput("invalid ns. Must be <db>.<coll>".into()))?;

        let local_schema = self.opts.local_schema.take();
        let est = self.encrypt_state();
        est.explicit = false;
        est.ns = Some(ns);

        match local_schema {
            Some(schema) => {
                est.schema = Some(schema);
                self.state = State::NeedMongoMarkings;
                Ok(())
            }
            None => self.try_collinfo_from_cache(),
        }
    }

    pub(crate) fn explicit_encrypt_init_inner(&mut self, msg: &Document) -> Result<()> {
        let spec = OptsSpec {
            key_descriptor: OptReq::Required,
            algorithm: OptReq::Required,
            iv: OptReq::Optional,
            ..OptsSpec::prohibit_all()
        };
        spec.validate(&self.opts, "explicit encryption")?;

        if let Some(id) = self.opts.key_id {
            self.kb.add_id(id)?;
        } else if let Some(name) = self.opts.key_alt_name.clone() {
            self.kb.add_name(&name)?;
        }

        if !msg.contains_key("v") {
            return Err(Error::ClientInput("invalid msg, must contain 'v'".into()));
        }

        let est = self.encrypt_state();
        est.explicit = true;
        est.original_cmd = Some(msg.clone());

        self.state_from_key_broker()
    }

    // -- collinfo -----------------------------------------------------------

    /// Consult the shared cache for this namespace's collinfo. Fully
    /// idempotent: context-local collinfo fields are reset on every entry, so
    /// re-polling after a peer failure starts from a clean slate.
    pub(crate) fn try_collinfo_from_cache(&mut self) -> Result<()> {
        let ns = self.encrypt_ns()?;
        let id = self.id;

        let est = self.encrypt_state();
        est.collinfo_owner = 0;
        est.collinfo_state = CachePairState::Pending;
        est.waiting_for_collinfo = false;

        match self.crypt.collinfo_cache.get_or_create(ns.as_str(), id) {
            CollinfoLookup::Done(collinfo) => {
                self.encrypt_state().collinfo_state = CachePairState::Done;
                self.set_schema_from_collinfo(&collinfo)?;
                self.state = State::NeedMongoMarkings;
            }
            CollinfoLookup::Owned => {
                self.encrypt_state().collinfo_owner = id;
                self.state = State::NeedMongoCollinfo;
            }
            CollinfoLookup::Pending { owner } => {
                let est = self.encrypt_state();
                est.collinfo_owner = owner;
                est.waiting_for_collinfo = true;
                self.state = State::Waiting;
            }
            CollinfoLookup::Failed(msg) => return Err(Error::Cache(msg)),
        }

        let est = self.encrypt_state();
        tracing::debug!(
            ns = %ns,
            pair_state = ?est.collinfo_state,
            owner = est.collinfo_owner,
            waiting = est.waiting_for_collinfo,
            "consulted collinfo cache"
        );
        Ok(())
    }

    /// Extract `options.validator.$jsonSchema` from a collinfo reply.
    /// Views cannot be auto-encrypted, and a validator carrying anything
    /// besides `$jsonSchema` is rejected outright.
    fn set_schema_from_collinfo(&mut self, collinfo: &Document) -> Result<()> {
        if matches!(collinfo.get_str("type"), Ok("view")) {
            return Err(Error::ClientInput("cannot auto encrypt a view".into()));
        }

        let validator = collinfo
            .get_document("options")
            .ok()
            .and_then(|options| options.get_document("validator").ok());

        if let Some(validator) = validator {
            if validator.keys().any(|k| k != "$jsonSchema") {
                return Err(Error::ClientInput(
                    "validator must contain only $jsonSchema".into(),
                ));
            }
            match validator.get("$jsonSchema") {
                Some(Bson::Document(schema)) => {
                    self.encrypt_state().schema = Some(schema.clone());
                }
                Some(_) => return Err(Error::ClientInput("malformed JSONSchema".into())),
                None => {}
            }
        }
        Ok(())
    }

    pub(crate) fn encrypt_op_collinfo(&mut self) -> Result<Document> {
        let ns = self.encrypt_ns()?;
        Ok(doc! {"name": ns.coll()})
    }

    pub(crate) fn encrypt_feed_collinfo(&mut self, collinfo: &Document) -> Result<()> {
        let ns = self.encrypt_ns()?;
        // Cache before parsing: peers consume the raw reply and run the same
        // extraction, so a view rejection hits every waiter identically.
        self.crypt
            .collinfo_cache
            .add_copy(ns.as_str(), collinfo, self.id);
        self.set_schema_from_collinfo(collinfo)
    }

    pub(crate) fn encrypt_done_collinfo(&mut self) -> Result<()> {
        let ns = self.encrypt_ns()?;
        // If no reply was fed the entry is still pending under this context;
        // complete it with an empty document so waiters resolve to
        // nothing-to-do instead of blocking until cleanup.
        self.crypt
            .collinfo_cache
            .add_copy(ns.as_str(), &Document::new(), self.id);

        self.state = if self.encrypt_state().schema.is_none() {
            State::NothingToDo
        } else {
            State::NeedMongoMarkings
        };
        Ok(())
    }

    // -- markings -----------------------------------------------------------

    pub(crate) fn encrypt_op_markings(&mut self) -> Result<Document> {
        self.encrypt_state()
            .schema
            .clone()
            .ok_or_else(|| Error::ClientInput("context has no schema".into()))
    }

    pub(crate) fn encrypt_feed_markings(&mut self, reply: &Document) -> Result<()> {
        let est = match &mut self.kind {
            CtxKind::Encrypt(est) => est,
            _ => unreachable!("encrypt step on non-encrypt context"),
        };

        if matches!(reply.get_bool("schemaRequiresEncryption"), Ok(false))
            || matches!(reply.get_bool("hasEncryptedPlaceholders"), Ok(false))
        {
            est.markings_skipped = true;
            return Ok(());
        }

        let marked = match reply.get("result") {
            Some(Bson::Document(d)) => d.clone(),
            Some(_) => {
                return Err(Error::MalformedMarking(
                    "'result' must be a document".into(),
                ))
            }
            None => return Err(Error::MalformedMarking("no 'result'".into())),
        };

        let kb = &mut self.kb;
        traverse::collect(&marked, TraverseMatch::Marking, &mut |payload| {
            let marking = Marking::parse(payload)?;
            match marking.key {
                KeyRef::Id(id) => kb.add_id(id),
                KeyRef::AltName(name) => kb.add_name(&name),
            }
        })?;

        self.encrypt_state().marked_cmd = Some(marked);
        Ok(())
    }

    pub(crate) fn encrypt_done_markings(&mut self) -> Result<()> {
        if self.encrypt_state().markings_skipped {
            self.state = State::NothingToDo;
            return Ok(());
        }
        self.state_from_key_broker()
    }

    // -- finalize -----------------------------------------------------------

    pub(crate) fn encrypt_finalize(&mut self) -> Result<Document> {
        let Ctx {
            kind,
            kb,
            crypt,
            opts,
            ..
        } = self;
        let est = match kind {
            CtxKind::Encrypt(est) => est,
            _ => unreachable!("encrypt step on non-encrypt context"),
        };
        let engine = crypt.engine.as_ref();

        let out = if est.explicit {
            let original = est
                .original_cmd
                .as_ref()
                .ok_or_else(|| Error::ClientInput("invalid msg, must contain 'v'".into()))?;
            let value = original
                .get("v")
                .ok_or_else(|| Error::ClientInput("invalid msg, must contain 'v'".into()))?;

            // No marking was produced by query analysis; synthesize one from
            // the context options. Init already validated the option set.
            let key = match (&opts.key_id, &opts.key_alt_name) {
                (Some(id), _) => KeyRef::Id(*id),
                (_, Some(name)) => KeyRef::AltName(name.clone()),
                _ => unreachable!("key descriptor validated at init"),
            };
            let algorithm = opts.algorithm.expect("algorithm validated at init");
            let marking = Marking {
                key,
                algorithm,
                iv: opts.iv,
                value: value.clone(),
            };

            let blob = marking_to_binary(kb, engine, &marking)?;
            doc! {"v": Bson::Binary(blob)}
        } else {
            let marked = est
                .marked_cmd
                .as_ref()
                .ok_or_else(|| Error::ClientInput("no marked command to finalize".into()))?;
            traverse::transform(marked, TraverseMatch::Marking, &mut |payload| {
                let marking = Marking::parse(payload)?;
                let blob = marking_to_binary(kb, engine, &marking)?;
                Ok(Some(Bson::Binary(blob)))
            })?
        };

        est.encrypted_cmd = Some(out.clone());
        Ok(out)
    }
}

/// Encrypt a marking's value with its resolved key and serialize the
/// resulting blob. A key the broker has not decrypted is an error here:
/// encryption never silently skips a field.
fn marking_to_binary(
    kb: &KeyBroker,
    engine: &dyn CryptoEngine,
    marking: &Marking,
) -> Result<Binary> {
    let (key_id, material) = kb.decrypted_key_for(&marking.key).ok_or_else(|| {
        Error::KeyBroker("no decrypted key material for marking".into())
    })?;

    let (original_bson_type, raw) = bson_util::value_to_raw(&marking.value)?;

    let iv = match marking.algorithm {
        Algorithm::Deterministic => Some(marking.iv.ok_or_else(|| {
            Error::Crypto("deterministic encryption requires an iv".into())
        })?),
        Algorithm::Random => marking.iv,
    };

    let ciphertext = engine.encrypt(&material, iv.as_ref(), &raw)?;

    let blob = Ciphertext {
        blob_subtype: marking.algorithm.blob_subtype(),
        key_id,
        original_bson_type,
        ciphertext: &ciphertext,
    }
    .serialize();

    Ok(Binary {
        subtype: BinarySubtype::Encrypted,
        bytes: blob,
    })
}
