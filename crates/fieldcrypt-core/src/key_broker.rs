//! Key acquisition and deduplication across concurrent contexts.
//!
//! Each context holds a [`KeyBroker`]: the ordered set of keys its operation
//! references, layered over the process-wide [`KeyStore`]. The store uses the
//! same pending/done pair design as the collinfo cache: the first context to
//! reference a key owns its fetch and KMS trip; peers wait for the broadcast
//! material. Once decrypted, material in the store is immutable.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use fieldcrypt_types::KeyId;
use tracing::debug;

use crate::crypto::{CryptoEngine, KeyMaterial};
use crate::error::{Error, Result};
use crate::kms::{aws_endpoint, KmsCtx, KmsRequestKind};
use crate::marking::KeyRef;

// ---------------------------------------------------------------------------
// Shared store
// ---------------------------------------------------------------------------

enum KeyPair {
    Pending { owner: u32 },
    Done(Arc<KeyMaterial>),
    Failed(String),
}

/// Outcome of a store lookup for one key reference.
pub enum StoreLookup {
    Done(Arc<KeyMaterial>),
    Owned,
    Pending { owner: u32 },
    Failed(String),
}

/// Process-wide store of decrypted key material, shared by all contexts of a
/// [`crate::Crypt`].
pub struct KeyStore {
    entries: Mutex<HashMap<KeyRef, KeyPair>>,
    changed: Condvar,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        }
    }

    fn get_or_create(&self, kref: &KeyRef, ctx_id: u32) -> StoreLookup {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(kref) {
            Some(KeyPair::Done(material)) => StoreLookup::Done(Arc::clone(material)),
            Some(KeyPair::Failed(msg)) => StoreLookup::Failed(msg.clone()),
            Some(KeyPair::Pending { owner }) if *owner == ctx_id => StoreLookup::Owned,
            Some(KeyPair::Pending { owner }) => StoreLookup::Pending { owner: *owner },
            None => {
                debug!(key = ?kref, ctx_id, "key store: created pending entry");
                entries.insert(kref.clone(), KeyPair::Pending { owner: ctx_id });
                StoreLookup::Owned
            }
        }
    }

    /// Publish decrypted material. Owner-only for pending entries; an absent
    /// entry is inserted directly (an alt-name owner publishing under the
    /// resolved id). A `Done` entry is never overwritten.
    fn add_material(&self, kref: &KeyRef, material: Arc<KeyMaterial>, ctx_id: u32) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(kref) {
            Some(KeyPair::Done(_)) => return,
            Some(KeyPair::Pending { owner }) if *owner != ctx_id => return,
            _ => {}
        }
        debug!(key = ?kref, ctx_id, "key store: material available");
        entries.insert(kref.clone(), KeyPair::Done(material));
        self.changed.notify_all();
    }

    /// Record a terminal failure for a key this context owns.
    fn fail(&self, kref: &KeyRef, msg: &str, ctx_id: u32) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(KeyPair::Pending { owner }) = entries.get(kref) {
            if *owner == ctx_id {
                debug!(key = ?kref, ctx_id, msg, "key store: entry failed");
                entries.insert(kref.clone(), KeyPair::Failed(msg.to_string()));
                self.changed.notify_all();
            }
        }
    }

    /// Block while every reference in `refs` is still pending under another
    /// context. Checked under the lock, so a broadcast between a poll and the
    /// wait cannot be lost.
    fn wait_for_any(&self, refs: &[KeyRef]) {
        let mut entries = self.entries.lock().unwrap();
        loop {
            let all_pending = refs
                .iter()
                .all(|r| matches!(entries.get(r), Some(KeyPair::Pending { .. })));
            if refs.is_empty() || !all_pending {
                return;
            }
            entries = self.changed.wait(entries).unwrap();
        }
    }

    /// Drop one pending entry owned by `ctx_id` and wake waiters so one of
    /// them can claim the fetch.
    fn release(&self, kref: &KeyRef, ctx_id: u32) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(KeyPair::Pending { owner }) = entries.get(kref) {
            if *owner == ctx_id {
                debug!(key = ?kref, ctx_id, "key store: released pending entry");
                entries.remove(kref);
                self.changed.notify_all();
            }
        }
    }

    /// Drop pending entries owned by `ctx_id` and wake waiters so one of
    /// them can claim the fetch.
    pub fn remove_by_owner(&self, ctx_id: u32) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, pair| !matches!(pair, KeyPair::Pending { owner } if *owner == ctx_id));
        if entries.len() != before {
            debug!(ctx_id, removed = before - entries.len(), "key store: released pending entries");
            self.changed.notify_all();
        }
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-context broker
// ---------------------------------------------------------------------------

enum EntryState {
    /// This context owns the fetch and has not yet seen a key document.
    NeedsFetch,
    /// A peer context owns the fetch; wait for the store broadcast.
    Fetching { owner: u32 },
    /// Key document received; a KMS trip is outstanding.
    Decrypting(KmsCtx),
    Decrypted(Arc<KeyMaterial>),
    /// The vault returned nothing for this key and the operation tolerates
    /// that (decrypt passes unresolved blobs through).
    Missing,
    Failed(String),
}

struct BrokerEntry {
    keyref: KeyRef,
    /// Resolved id: immediate for id references, set when an alt-name entry
    /// matches a key document.
    key_id: Option<KeyId>,
    state: EntryState,
}

/// Aggregate broker state, driving the owning context's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// At least one owned key still needs its key vault document.
    NeedsKeyDocs,
    /// At least one KMS trip is outstanding.
    NeedsKms,
    /// Only peer-owned keys remain; wait for their broadcasts.
    WaitingOnPeers,
    /// Every referenced key is decrypted (or none were referenced).
    Done,
}

/// The local KMS provider configuration a broker decrypts with.
#[derive(Clone, Default)]
pub struct KmsProviders {
    pub(crate) local_key: Option<Arc<KeyMaterial>>,
}

pub struct KeyBroker {
    ctx_id: u32,
    store: Arc<KeyStore>,
    engine: Arc<dyn CryptoEngine>,
    providers: KmsProviders,
    /// Entries in first-reference order; traversal order is observable.
    entries: Vec<BrokerEntry>,
}

impl KeyBroker {
    pub(crate) fn new(
        ctx_id: u32,
        store: Arc<KeyStore>,
        engine: Arc<dyn CryptoEngine>,
        providers: KmsProviders,
    ) -> Self {
        Self {
            ctx_id,
            store,
            engine,
            providers,
            entries: Vec::new(),
        }
    }

    /// Reference a key by id. Idempotent.
    pub fn add_id(&mut self, id: KeyId) -> Result<()> {
        if self.entries.iter().any(|e| e.key_id == Some(id)) {
            return Ok(());
        }
        let kref = KeyRef::Id(id);
        let state = self.initial_state(&kref)?;
        self.entries.push(BrokerEntry {
            keyref: kref,
            key_id: Some(id),
            state,
        });
        Ok(())
    }

    /// Reference a key by alternate name. Idempotent.
    pub fn add_name(&mut self, name: &str) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|e| matches!(&e.keyref, KeyRef::AltName(n) if n == name))
        {
            return Ok(());
        }
        let kref = KeyRef::AltName(name.to_string());
        let state = self.initial_state(&kref)?;
        self.entries.push(BrokerEntry {
            keyref: kref,
            key_id: None,
            state,
        });
        Ok(())
    }

    fn initial_state(&self, kref: &KeyRef) -> Result<EntryState> {
        Ok(match self.store.get_or_create(kref, self.ctx_id) {
            StoreLookup::Done(material) => EntryState::Decrypted(material),
            StoreLookup::Owned => EntryState::NeedsFetch,
            StoreLookup::Pending { owner } => EntryState::Fetching { owner },
            StoreLookup::Failed(msg) => return Err(Error::KeyBroker(msg)),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The key vault find filter covering every key this context must fetch:
    /// `{$or: [{_id: {$in: [...]}}, {keyAltNames: {$in: [...]}}]}`.
    pub fn filter(&self) -> Document {
        let mut ids = Vec::new();
        let mut names = Vec::new();
        for entry in &self.entries {
            if !matches!(entry.state, EntryState::NeedsFetch) {
                continue;
            }
            match &entry.keyref {
                KeyRef::Id(id) => ids.push(Bson::Binary(Binary {
                    subtype: BinarySubtype::Uuid,
                    bytes: id.0.to_vec(),
                })),
                KeyRef::AltName(name) => names.push(Bson::String(name.clone())),
            }
        }
        doc! {
            "$or": [
                {"_id": {"$in": ids}},
                {"keyAltNames": {"$in": names}},
            ]
        }
    }

    /// Feed one key vault document. Matches it against owned entries by id or
    /// alt name, then either decrypts the material locally (provider `local`)
    /// or parks a KMS trip (provider `aws`).
    pub fn feed(&mut self, key_doc: &Document) -> Result<()> {
        let parsed = KeyDoc::parse(key_doc)?;

        // Resolve which entries this document satisfies, without holding a
        // mutable borrow across the match.
        let mut matched = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let hit = match &entry.keyref {
                KeyRef::Id(id) => *id == parsed.id,
                KeyRef::AltName(name) => parsed.alt_names.iter().any(|n| n == name),
            };
            if hit && matches!(entry.state, EntryState::NeedsFetch) {
                matched.push(i);
            }
        }
        if matched.is_empty() {
            return Err(Error::KeyBroker(
                "key document did not match any requested key".into(),
            ));
        }

        // An alt-name entry materializes its uuid; if a peer already owns the
        // id, this context waits instead of driving KMS a second time.
        for &i in &matched {
            self.entries[i].key_id = Some(parsed.id);
            if matches!(self.entries[i].keyref, KeyRef::AltName(_)) {
                match self.store.get_or_create(&KeyRef::Id(parsed.id), self.ctx_id) {
                    StoreLookup::Done(material) => {
                        self.complete_entry(i, material);
                        continue;
                    }
                    StoreLookup::Pending { owner } => {
                        self.entries[i].state = EntryState::Fetching { owner };
                        continue;
                    }
                    StoreLookup::Owned => {}
                    StoreLookup::Failed(msg) => return Err(Error::KeyBroker(msg)),
                }
            }

            match &parsed.master_key {
                MasterKeyDoc::Local => {
                    let local_key = self.providers.local_key.clone().ok_or_else(|| {
                        Error::KeyBroker("no local kms provider configured".into())
                    })?;
                    let material = self
                        .engine
                        .decrypt(&local_key, &parsed.key_material)
                        .map_err(|e| {
                            let msg = format!("failed to unwrap key {}: {e}", parsed.id);
                            self.fail_entry_in_store(i, &msg);
                            Error::KeyBroker(msg)
                        })?;
                    self.complete_with_material(i, KeyMaterial::new(material));
                }
                MasterKeyDoc::Aws { region, cmk } => {
                    debug!(key = %parsed.id, region, "key broker: parked KMS decrypt trip");
                    self.entries[i].state = EntryState::Decrypting(KmsCtx::new(
                        KmsRequestKind::Decrypt,
                        aws_endpoint(region),
                        Some(cmk.clone()),
                        parsed.key_material.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Called when the application has fed every key vault result. With
    /// `allow_missing` (decrypt), unfetched keys become terminal `Missing`
    /// entries and their store ownership is released; without it (encrypt),
    /// an unfetched key is an error.
    pub fn done_feeding(&mut self, allow_missing: bool) -> Result<()> {
        if !allow_missing {
            if self
                .entries
                .iter()
                .any(|e| matches!(e.state, EntryState::NeedsFetch))
            {
                return Err(Error::KeyBroker("did not provide all keys".into()));
            }
            return Ok(());
        }
        for entry in &mut self.entries {
            if matches!(entry.state, EntryState::NeedsFetch) {
                debug!(key = ?entry.keyref, "key broker: key unavailable, will pass through");
                self.store.release(&entry.keyref, self.ctx_id);
                entry.state = EntryState::Missing;
            }
        }
        Ok(())
    }

    /// Yield the next outstanding KMS context, each at most once.
    pub fn next_kms_ctx(&mut self) -> Option<&mut KmsCtx> {
        for entry in &mut self.entries {
            if let EntryState::Decrypting(kms) = &mut entry.state {
                if !kms.yielded {
                    kms.yielded = true;
                    return Some(kms);
                }
            }
        }
        None
    }

    /// Complete all outstanding KMS trips: every yielded context must be fed;
    /// material is published to the store and local entries flip to
    /// decrypted.
    pub fn kms_done(&mut self) -> Result<()> {
        for i in 0..self.entries.len() {
            if let EntryState::Decrypting(kms) = &mut self.entries[i].state {
                if !kms.done() {
                    return Err(Error::KeyBroker("KMS reply not complete".into()));
                }
                let material = KeyMaterial::new(kms.take_reply()?);
                self.complete_with_material(i, material);
            }
        }
        Ok(())
    }

    /// The context id to wait on for the next peer-owned key, or 0.
    pub fn next_ctx_id(&self) -> u32 {
        self.entries
            .iter()
            .find_map(|e| match e.state {
                EntryState::Fetching { owner } => Some(owner),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// Resolve peer-owned entries from the store; in blocking mode, wait for
    /// broadcasts until none remain. If a peer abandoned a key, this context
    /// claims the fetch and the entry returns to `NeedsFetch`.
    pub fn check_cache_and_wait(&mut self, block: bool) -> Result<()> {
        loop {
            let mut waiting_refs = Vec::new();
            let mut claimed = false;
            for i in 0..self.entries.len() {
                if let EntryState::Fetching { .. } = self.entries[i].state {
                    let kref = self.entries[i].keyref.clone();
                    match self.store.get_or_create(&kref, self.ctx_id) {
                        StoreLookup::Done(material) => self.complete_entry(i, material),
                        StoreLookup::Owned => {
                            debug!(key = ?kref, ctx_id = self.ctx_id, "key broker: claimed abandoned fetch");
                            self.entries[i].state = EntryState::NeedsFetch;
                            claimed = true;
                        }
                        StoreLookup::Pending { owner } => {
                            self.entries[i].state = EntryState::Fetching { owner };
                            waiting_refs.push(kref);
                        }
                        StoreLookup::Failed(msg) => {
                            self.entries[i].state = EntryState::Failed(msg.clone());
                            return Err(Error::KeyBroker(msg));
                        }
                    }
                }
            }
            // A claimed fetch means this context has work to do now; do not
            // keep blocking on the remaining peers.
            if waiting_refs.is_empty() || claimed || !block {
                return Ok(());
            }
            self.store.wait_for_any(&waiting_refs);
        }
    }

    /// Look up decrypted material by key id. `None` is not an error at
    /// decrypt time: unresolved blobs pass through unchanged.
    pub fn decrypted_key_by_id(&self, id: &KeyId) -> Option<Arc<KeyMaterial>> {
        self.entries.iter().find_map(|e| match (&e.key_id, &e.state) {
            (Some(entry_id), EntryState::Decrypted(material)) if entry_id == id => {
                Some(Arc::clone(material))
            }
            _ => None,
        })
    }

    /// Look up decrypted material for a marking's key reference. An id
    /// reference also matches an entry that was added by alt name and has
    /// since resolved to that id.
    pub fn decrypted_key_for(&self, kref: &KeyRef) -> Option<(KeyId, Arc<KeyMaterial>)> {
        self.entries.iter().find_map(|e| {
            let hit = match kref {
                KeyRef::Id(id) => e.key_id == Some(*id),
                KeyRef::AltName(_) => e.keyref == *kref,
            };
            if !hit {
                return None;
            }
            match (&e.key_id, &e.state) {
                (Some(id), EntryState::Decrypted(material)) => Some((*id, Arc::clone(material))),
                _ => None,
            }
        })
    }

    /// Surface any terminal failure.
    pub fn status(&self) -> Result<()> {
        for entry in &self.entries {
            if let EntryState::Failed(msg) = &entry.state {
                return Err(Error::KeyBroker(msg.clone()));
            }
        }
        Ok(())
    }

    pub fn state(&self) -> BrokerState {
        let mut waiting = false;
        let mut kms = false;
        for entry in &self.entries {
            match entry.state {
                EntryState::NeedsFetch => return BrokerState::NeedsKeyDocs,
                EntryState::Decrypting(_) => kms = true,
                EntryState::Fetching { .. } => waiting = true,
                _ => {}
            }
        }
        if kms {
            BrokerState::NeedsKms
        } else if waiting {
            BrokerState::WaitingOnPeers
        } else {
            BrokerState::Done
        }
    }

    fn complete_entry(&mut self, i: usize, material: Arc<KeyMaterial>) {
        self.entries[i].state = EntryState::Decrypted(material);
    }

    /// Flip entry `i` to decrypted and publish under both its original
    /// reference and its resolved id.
    fn complete_with_material(&mut self, i: usize, material: KeyMaterial) {
        let material = Arc::new(material);
        let kref = self.entries[i].keyref.clone();
        self.store
            .add_material(&kref, Arc::clone(&material), self.ctx_id);
        if let (KeyRef::AltName(_), Some(id)) = (&kref, self.entries[i].key_id) {
            self.store
                .add_material(&KeyRef::Id(id), Arc::clone(&material), self.ctx_id);
        }
        self.entries[i].state = EntryState::Decrypted(material);
    }

    fn fail_entry_in_store(&self, i: usize, msg: &str) {
        let kref = &self.entries[i].keyref;
        self.store.fail(kref, msg, self.ctx_id);
        if let (KeyRef::AltName(_), Some(id)) = (kref, self.entries[i].key_id) {
            self.store.fail(&KeyRef::Id(id), msg, self.ctx_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Key vault documents
// ---------------------------------------------------------------------------

enum MasterKeyDoc {
    Local,
    Aws { region: String, cmk: String },
}

struct KeyDoc {
    id: KeyId,
    alt_names: Vec<String>,
    key_material: Vec<u8>,
    master_key: MasterKeyDoc,
}

impl KeyDoc {
    fn parse(doc: &Document) -> Result<Self> {
        let id = match doc.get("_id") {
            Some(Bson::Binary(bin)) if bin.subtype == BinarySubtype::Uuid => {
                KeyId::from_slice(&bin.bytes).ok_or_else(|| {
                    Error::KeyBroker("key document _id must be a 16-byte UUID".into())
                })?
            }
            _ => {
                return Err(Error::KeyBroker(
                    "key document missing UUID _id".into(),
                ))
            }
        };

        let key_material = match doc.get("keyMaterial") {
            Some(Bson::Binary(bin)) => bin.bytes.clone(),
            _ => {
                return Err(Error::KeyBroker(
                    "key document missing keyMaterial binary".into(),
                ))
            }
        };

        let mut alt_names = Vec::new();
        if let Some(Bson::Array(names)) = doc.get("keyAltNames") {
            for name in names {
                match name {
                    Bson::String(s) => alt_names.push(s.clone()),
                    _ => {
                        return Err(Error::KeyBroker(
                            "keyAltNames must be strings".into(),
                        ))
                    }
                }
            }
        }

        let master = doc
            .get_document("masterKey")
            .map_err(|_| Error::KeyBroker("key document missing masterKey".into()))?;
        let master_key = match master.get_str("provider") {
            Ok("local") => MasterKeyDoc::Local,
            Ok("aws") => MasterKeyDoc::Aws {
                region: master
                    .get_str("region")
                    .map_err(|_| Error::KeyBroker("aws masterKey missing region".into()))?
                    .to_string(),
                cmk: master
                    .get_str("key")
                    .map_err(|_| Error::KeyBroker("aws masterKey missing key".into()))?
                    .to_string(),
            },
            Ok(other) => {
                return Err(Error::KeyBroker(format!(
                    "unsupported kms provider '{other}'"
                )))
            }
            Err(_) => return Err(Error::KeyBroker("masterKey missing provider".into())),
        };

        Ok(KeyDoc {
            id,
            alt_names,
            key_material,
            master_key,
        })
    }
}
