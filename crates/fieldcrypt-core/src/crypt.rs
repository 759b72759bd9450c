//! The process-wide library handle.
//!
//! A [`Crypt`] owns everything contexts share: the collinfo cache, the key
//! store, the crypto engine, and KMS provider configuration. It performs no
//! I/O; contexts created from it drive all side effects through the
//! application.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::collinfo::CollinfoCache;
use crate::crypto::{Aes256GcmEngine, CryptoEngine, KeyMaterial, MIN_KEY_LEN};
use crate::ctx::CtxBuilder;
use crate::error::{Error, Result};
use crate::key_broker::{KeyStore, KmsProviders};

/// Construction-time configuration.
#[derive(Default)]
pub struct CryptConfig {
    /// Key material for the `local` KMS provider, if configured.
    pub local_kms_key: Option<Vec<u8>>,
    /// When set, contexts never block inside `wait_done`; the application
    /// polls instead.
    pub cache_noblock: bool,
}

pub struct Crypt {
    pub(crate) collinfo_cache: CollinfoCache,
    pub(crate) key_store: Arc<KeyStore>,
    pub(crate) engine: Arc<dyn CryptoEngine>,
    pub(crate) providers: KmsProviders,
    pub(crate) cache_noblock: bool,
    next_ctx_id: AtomicU32,
}

impl Crypt {
    /// Build with the default AES-256-GCM engine.
    pub fn new(config: CryptConfig) -> Result<Arc<Self>> {
        Self::with_engine(config, Arc::new(Aes256GcmEngine))
    }

    /// Build with a caller-provided crypto engine.
    pub fn with_engine(config: CryptConfig, engine: Arc<dyn CryptoEngine>) -> Result<Arc<Self>> {
        let local_key = match config.local_kms_key {
            Some(bytes) => {
                if bytes.len() < MIN_KEY_LEN {
                    return Err(Error::ClientInput(format!(
                        "local kms key must be at least {MIN_KEY_LEN} bytes"
                    )));
                }
                Some(Arc::new(KeyMaterial::new(bytes)))
            }
            None => None,
        };

        Ok(Arc::new(Crypt {
            collinfo_cache: CollinfoCache::new(),
            key_store: Arc::new(KeyStore::new()),
            engine,
            providers: KmsProviders { local_key },
            cache_noblock: config.cache_noblock,
            next_ctx_id: AtomicU32::new(1),
        }))
    }

    /// Start building a context. Context ids are unique for the life of this
    /// handle; 0 is reserved as "no context".
    pub fn ctx(self: &Arc<Self>) -> CtxBuilder {
        let id = self.next_ctx_id.fetch_add(1, Ordering::Relaxed);
        CtxBuilder::new(Arc::clone(self), id)
    }
}
