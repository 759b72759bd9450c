//! The per-operation context state machine.
//!
//! A context drives one end-to-end encrypt, decrypt, or create-data-key
//! operation. It performs no I/O: whenever it enters a `Need*` state it
//! returns control, the application performs the side effect (listCollections,
//! query analysis, key vault find, KMS round trip) and feeds the result back.
//! One thread drives one context; everything shared lives in [`Crypt`].

mod datakey;
mod decrypt;
mod encrypt;

pub(crate) use datakey::DataKeyState;
pub(crate) use decrypt::DecryptState;
pub(crate) use encrypt::EncryptState;

use std::sync::Arc;

use bson::Document;
use fieldcrypt_types::KeyId;
use tracing::debug;

use crate::crypt::Crypt;
use crate::crypto::{Algorithm, IV_LEN};
use crate::error::{Error, Result};
use crate::key_broker::{BrokerState, KeyBroker};
use crate::kms::KmsCtx;
use crate::options::{CtxOpts, MasterKeyOpt};

/// Context lifecycle states. `Need*` states hand control to the application;
/// `Waiting` means another context owns a fetch this one depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Error,
    NothingToDo,
    NeedMongoCollinfo,
    NeedMongoMarkings,
    NeedMongoKeys,
    NeedKms,
    Waiting,
    Ready,
    Done,
}

pub(crate) enum CtxKind {
    Encrypt(EncryptState),
    Decrypt(DecryptState),
    DataKey(DataKeyState),
}

pub struct Ctx {
    pub(crate) crypt: Arc<Crypt>,
    pub(crate) state: State,
    pub(crate) status: Option<Error>,
    pub(crate) kb: KeyBroker,
    pub(crate) opts: CtxOpts,
    pub(crate) id: u32,
    pub(crate) cache_noblock: bool,
    pub(crate) kind: CtxKind,
    cleaned: bool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects options, then initializes one concrete context shape. Option
/// violations surface when the init method runs, leaving the context in the
/// error state with a recorded status.
pub struct CtxBuilder {
    crypt: Arc<Crypt>,
    id: u32,
    opts: CtxOpts,
}

impl CtxBuilder {
    pub(crate) fn new(crypt: Arc<Crypt>, id: u32) -> Self {
        Self {
            crypt,
            id,
            opts: CtxOpts::default(),
        }
    }

    pub fn key_id(mut self, id: KeyId) -> Self {
        self.opts.key_id = Some(id);
        self
    }

    pub fn key_alt_name(mut self, name: impl Into<String>) -> Self {
        self.opts.key_alt_name = Some(name.into());
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.opts.algorithm = Some(algorithm);
        self
    }

    pub fn iv(mut self, iv: [u8; IV_LEN]) -> Self {
        self.opts.iv = Some(iv);
        self
    }

    pub fn masterkey_local(mut self) -> Self {
        self.opts.masterkey = Some(MasterKeyOpt::Local);
        self
    }

    pub fn masterkey_aws(mut self, region: impl Into<String>, cmk: impl Into<String>) -> Self {
        self.opts.masterkey = Some(MasterKeyOpt::Aws {
            region: region.into(),
            cmk: cmk.into(),
        });
        self
    }

    pub fn local_schema(mut self, schema: Document) -> Self {
        self.opts.local_schema = Some(schema);
        self
    }

    /// Auto-encryption of an outgoing command for `ns` (`"<db>.<coll>"`).
    pub fn encrypt_init(self, ns: &str) -> Ctx {
        let mut ctx = self.into_ctx(CtxKind::Encrypt(EncryptState::default()));
        if let Err(e) = ctx.encrypt_init_inner(ns) {
            ctx.fail(e);
        }
        ctx
    }

    /// Explicit encryption of one value: `msg` must be `{"v": <value>}`.
    pub fn explicit_encrypt_init(self, msg: &Document) -> Ctx {
        let mut ctx = self.into_ctx(CtxKind::Encrypt(EncryptState::default()));
        if let Err(e) = ctx.explicit_encrypt_init_inner(msg) {
            ctx.fail(e);
        }
        ctx
    }

    /// Auto-decryption of an incoming reply document.
    pub fn decrypt_init(self, doc: &Document) -> Ctx {
        let mut ctx = self.into_ctx(CtxKind::Decrypt(DecryptState::default()));
        if let Err(e) = ctx.decrypt_init_inner(doc) {
            ctx.fail(e);
        }
        ctx
    }

    /// Explicit decryption of one value: `msg` must be
    /// `{"v": <subtype-6 binary>}`.
    pub fn explicit_decrypt_init(self, msg: &Document) -> Ctx {
        let mut ctx = self.into_ctx(CtxKind::Decrypt(DecryptState::default()));
        if let Err(e) = ctx.explicit_decrypt_init_inner(msg) {
            ctx.fail(e);
        }
        ctx
    }

    /// Creation of a new data key wrapped by the configured master key.
    pub fn datakey_init(self) -> Ctx {
        let mut ctx = self.into_ctx(CtxKind::DataKey(DataKeyState::default()));
        if let Err(e) = ctx.datakey_init_inner() {
            ctx.fail(e);
        }
        ctx
    }

    fn into_ctx(self, kind: CtxKind) -> Ctx {
        let kb = KeyBroker::new(
            self.id,
            Arc::clone(&self.crypt.key_store),
            Arc::clone(&self.crypt.engine),
            self.crypt.providers.clone(),
        );
        let cache_noblock = self.crypt.cache_noblock;
        Ctx {
            crypt: self.crypt,
            state: State::NothingToDo,
            status: None,
            kb,
            opts: self.opts,
            id: self.id,
            cache_noblock,
            kind,
            cleaned: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Common lifecycle
// ---------------------------------------------------------------------------

impl Ctx {
    pub fn state(&self) -> State {
        self.state
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The finalized output document, once this context reached `Done`.
    pub fn output(&self) -> Option<&Document> {
        match &self.kind {
            CtxKind::Encrypt(est) => est.encrypted_cmd.as_ref(),
            CtxKind::Decrypt(dst) => dst.decrypted_doc.as_ref(),
            CtxKind::DataKey(dk) => dk.key_doc.as_ref(),
        }
    }

    /// The recorded failure, if this context has entered the error state.
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record the first failure and latch the error state. Every later call
    /// returns the recorded status.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if self.status.is_none() {
            debug!(ctx_id = self.id, %err, "context failed");
            self.status = Some(err.clone());
        }
        self.state = State::Error;
        err
    }

    fn check_live(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn expect_state(&mut self, expected: State, op: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            let state = self.state;
            Err(self.fail(Error::ClientInput(format!(
                "{op} called in state {state:?}"
            ))))
        }
    }

    /// Derive the context state from the key broker: keys to fetch, KMS
    /// trips to drive, peers to wait on, or ready to finalize.
    pub(crate) fn state_from_key_broker(&mut self) -> Result<()> {
        self.kb.status()?;
        self.state = match self.kb.state() {
            BrokerState::NeedsKeyDocs => State::NeedMongoKeys,
            BrokerState::NeedsKms => State::NeedKms,
            BrokerState::WaitingOnPeers => State::Waiting,
            BrokerState::Done => State::Ready,
        };
        Ok(())
    }

    // -- collinfo step (auto-encrypt only) ----------------------------------

    /// Build the listCollections filter `{"name": <coll>}`.
    pub fn mongo_op_collinfo(&mut self) -> Result<Document> {
        self.check_live()?;
        self.expect_state(State::NeedMongoCollinfo, "mongo_op_collinfo")?;
        match self.encrypt_op_collinfo() {
            Ok(doc) => Ok(doc),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Feed one listCollections reply document.
    pub fn mongo_feed_collinfo(&mut self, collinfo: &Document) -> Result<()> {
        self.check_live()?;
        self.expect_state(State::NeedMongoCollinfo, "mongo_feed_collinfo")?;
        match self.encrypt_feed_collinfo(collinfo) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Finish the collinfo step, whether or not a reply was fed.
    pub fn mongo_done_collinfo(&mut self) -> Result<()> {
        self.check_live()?;
        self.expect_state(State::NeedMongoCollinfo, "mongo_done_collinfo")?;
        match self.encrypt_done_collinfo() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    // -- markings step (auto-encrypt only) ----------------------------------

    /// The schema to hand to query analysis.
    pub fn mongo_op_markings(&mut self) -> Result<Document> {
        self.check_live()?;
        self.expect_state(State::NeedMongoMarkings, "mongo_op_markings")?;
        match self.encrypt_op_markings() {
            Ok(doc) => Ok(doc),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Feed the query-analysis reply.
    pub fn mongo_feed_markings(&mut self, reply: &Document) -> Result<()> {
        self.check_live()?;
        self.expect_state(State::NeedMongoMarkings, "mongo_feed_markings")?;
        match self.encrypt_feed_markings(reply) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn mongo_done_markings(&mut self) -> Result<()> {
        self.check_live()?;
        self.expect_state(State::NeedMongoMarkings, "mongo_done_markings")?;
        match self.encrypt_done_markings() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    // -- key vault step (encrypt and decrypt) -------------------------------

    /// The key vault find filter covering every referenced key.
    pub fn mongo_op_keys(&mut self) -> Result<Document> {
        self.check_live()?;
        self.expect_state(State::NeedMongoKeys, "mongo_op_keys")?;
        Ok(self.kb.filter())
    }

    /// Feed one key vault document.
    pub fn mongo_feed_keys(&mut self, key_doc: &Document) -> Result<()> {
        self.check_live()?;
        self.expect_state(State::NeedMongoKeys, "mongo_feed_keys")?;
        match self.kb.feed(key_doc) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn mongo_done_keys(&mut self) -> Result<()> {
        self.check_live()?;
        self.expect_state(State::NeedMongoKeys, "mongo_done_keys")?;
        // Decryption tolerates keys the vault did not return; the unresolved
        // blobs pass through finalize unchanged. Encryption cannot.
        let allow_missing = matches!(self.kind, CtxKind::Decrypt(_));
        if let Err(e) = self.kb.done_feeding(allow_missing) {
            return Err(self.fail(e));
        }
        if let Err(e) = self.state_from_key_broker() {
            return Err(self.fail(e));
        }
        Ok(())
    }

    // -- KMS step -----------------------------------------------------------

    /// Yield the next outstanding KMS round trip, each at most once.
    /// `None` once all trips have been handed out (or in any other state).
    pub fn next_kms_ctx(&mut self) -> Option<&mut KmsCtx> {
        if self.status.is_some() || self.state != State::NeedKms {
            return None;
        }
        if let CtxKind::DataKey(dk) = &mut self.kind {
            return dk.next_kms_ctx();
        }
        self.kb.next_kms_ctx()
    }

    /// Complete the KMS step; every yielded trip must have been fed.
    pub fn kms_done(&mut self) -> Result<()> {
        self.check_live()?;
        self.expect_state(State::NeedKms, "kms_done")?;
        if let CtxKind::DataKey(dk) = &mut self.kind {
            if let Err(e) = dk.finish_kms() {
                return Err(self.fail(e));
            }
            self.state = State::Ready;
            return Ok(());
        }
        if let Err(e) = self.kb.kms_done() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.state_from_key_broker() {
            return Err(self.fail(e));
        }
        Ok(())
    }

    // -- waiting on peers ---------------------------------------------------

    /// Resolve dependencies owned by other contexts. Blocks on the shared
    /// store unless the handle was configured `cache_noblock`, in which case
    /// it polls once and returns the current snapshot.
    pub fn wait_done(&mut self) -> Result<()> {
        self.check_live()?;
        self.expect_state(State::Waiting, "wait_done")?;

        let waiting_for_collinfo =
            matches!(&self.kind, CtxKind::Encrypt(est) if est.waiting_for_collinfo);

        if waiting_for_collinfo {
            if !self.cache_noblock {
                let ns = match self.encrypt_ns() {
                    Ok(ns) => ns,
                    Err(e) => return Err(self.fail(e)),
                };
                if let Err(e) = self.crypt.collinfo_cache.wait(ns.as_str(), None) {
                    return Err(self.fail(e));
                }
            }
            match self.try_collinfo_from_cache() {
                Ok(()) => Ok(()),
                Err(e) => Err(self.fail(e)),
            }
        } else {
            let block = !self.cache_noblock;
            if let Err(e) = self.kb.check_cache_and_wait(block) {
                return Err(self.fail(e));
            }
            if let Err(e) = self.state_from_key_broker() {
                return Err(self.fail(e));
            }
            Ok(())
        }
    }

    /// The context id this one is waiting on, or 0. A collinfo owner id is
    /// yielded once per poll cycle.
    pub fn next_dependent_ctx_id(&mut self) -> u32 {
        if let CtxKind::Encrypt(est) = &mut self.kind {
            if est.waiting_for_collinfo {
                return std::mem::take(&mut est.collinfo_owner);
            }
        }
        self.kb.next_ctx_id()
    }

    // -- completion ---------------------------------------------------------

    /// Produce the operation's output document and move to `Done`.
    pub fn finalize(&mut self) -> Result<Document> {
        self.check_live()?;
        self.expect_state(State::Ready, "finalize")?;
        let result = if matches!(self.kind, CtxKind::Encrypt(_)) {
            self.encrypt_finalize()
        } else if matches!(self.kind, CtxKind::Decrypt(_)) {
            self.decrypt_finalize()
        } else {
            self.datakey_finalize()
        };
        match result {
            Ok(doc) => {
                debug!(ctx_id = self.id, "context done");
                self.state = State::Done;
                Ok(doc)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Release shared-store ownership held by this context. Idempotent, safe
    /// in the error state, and also run on drop. Waiters on anything this
    /// context owned are woken so one can take over the fetch.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.crypt.collinfo_cache.remove_by_owner(self.id);
        self.crypt.key_store.remove_by_owner(self.id);
    }
}

impl Drop for Ctx {
    fn drop(&mut self) {
        self.cleanup();
    }
}
