//! Shared cache of `listCollections` replies, keyed by namespace.
//!
//! Many contexts may need the same collection's schema concurrently. The
//! first one to ask becomes the owner of a pending entry and performs the
//! out-of-band fetch; peers wait on the entry and consume the broadcast
//! result. An owner that dies before completing releases the entry so a
//! waiter can claim the fetch.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use bson::Document;
use tracing::debug;

use crate::error::{Error, Result};

/// Observed state of a cache pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePairState {
    Pending,
    Done,
    Failed,
}

enum CollinfoPair {
    Pending { owner: u32 },
    Done(Document),
    Failed(String),
}

/// Result of a cache lookup, from the calling context's point of view.
pub enum CollinfoLookup {
    /// A reply is cached; here is a copy.
    Done(Document),
    /// No reply yet and this context owns the fetch.
    Owned,
    /// Another context owns the fetch; wait for it.
    Pending { owner: u32 },
    /// The owner recorded a failure for this namespace.
    Failed(String),
}

pub struct CollinfoCache {
    entries: Mutex<HashMap<String, CollinfoPair>>,
    changed: Condvar,
}

impl CollinfoCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        }
    }

    /// Look up `ns`, creating a pending entry owned by `ctx_id` if absent.
    /// Atomic with respect to other callers: exactly one context observes
    /// `Owned` per pending cycle.
    pub fn get_or_create(&self, ns: &str, ctx_id: u32) -> CollinfoLookup {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(ns) {
            Some(CollinfoPair::Done(doc)) => CollinfoLookup::Done(doc.clone()),
            Some(CollinfoPair::Failed(msg)) => CollinfoLookup::Failed(msg.clone()),
            Some(CollinfoPair::Pending { owner }) if *owner == ctx_id => CollinfoLookup::Owned,
            Some(CollinfoPair::Pending { owner }) => CollinfoLookup::Pending { owner: *owner },
            None => {
                debug!(ns, ctx_id, "collinfo cache: created pending entry");
                entries.insert(ns.to_string(), CollinfoPair::Pending { owner: ctx_id });
                CollinfoLookup::Owned
            }
        }
    }

    /// Store a copy of the fetched reply. Only the pending owner may
    /// transition the entry; any other caller is a silent no-op.
    pub fn add_copy(&self, ns: &str, doc: &Document, ctx_id: u32) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(ns) {
            Some(CollinfoPair::Pending { owner }) if *owner == ctx_id => {
                debug!(ns, ctx_id, "collinfo cache: entry done");
                entries.insert(ns.to_string(), CollinfoPair::Done(doc.clone()));
                self.changed.notify_all();
            }
            _ => {
                debug!(ns, ctx_id, "collinfo cache: add_copy by non-owner ignored");
            }
        }
    }

    /// Record a failure for `ns`. Owner-only, like [`CollinfoCache::add_copy`].
    pub fn fail(&self, ns: &str, msg: &str, ctx_id: u32) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(ns) {
            Some(CollinfoPair::Pending { owner }) if *owner == ctx_id => {
                debug!(ns, ctx_id, msg, "collinfo cache: entry failed");
                entries.insert(ns.to_string(), CollinfoPair::Failed(msg.to_string()));
                self.changed.notify_all();
            }
            _ => {}
        }
    }

    /// Block until the entry for `ns` is no longer pending under another
    /// owner (resolved, removed, or never existed). The predicate is checked
    /// under the lock, so a broadcast cannot be lost between a poll and the
    /// wait.
    pub fn wait(&self, ns: &str, timeout: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        loop {
            match entries.get(ns) {
                Some(CollinfoPair::Pending { .. }) => {}
                _ => return Ok(()),
            }
            entries = match timeout {
                None => self.changed.wait(entries).unwrap(),
                Some(dur) => {
                    let (guard, res) = self.changed.wait_timeout(entries, dur).unwrap();
                    if res.timed_out() {
                        return Err(Error::Cache(format!(
                            "timed out waiting for collection info on {ns}"
                        )));
                    }
                    guard
                }
            };
        }
    }

    /// Drop any pending entries owned by `ctx_id` and wake waiters, one of
    /// which will become the new owner through [`CollinfoCache::get_or_create`].
    pub fn remove_by_owner(&self, ctx_id: u32) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, pair| !matches!(pair, CollinfoPair::Pending { owner } if *owner == ctx_id));
        if entries.len() != before {
            debug!(ctx_id, removed = before - entries.len(), "collinfo cache: released pending entries");
            self.changed.notify_all();
        }
    }
}

impl Default for CollinfoCache {
    fn default() -> Self {
        Self::new()
    }
}
