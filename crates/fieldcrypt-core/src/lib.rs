pub mod bson_util;
pub mod ciphertext;
pub mod collinfo;
pub mod crypt;
pub mod crypto;
pub mod ctx;
pub mod error;
pub mod key_broker;
pub mod kms;
pub mod marking;
pub mod options;
pub mod traverse;

pub use ciphertext::Ciphertext;
pub use crypt::{Crypt, CryptConfig};
pub use crypto::{Aes256GcmEngine, Algorithm, CryptoEngine, KeyMaterial};
pub use ctx::{Ctx, CtxBuilder, State};
pub use error::{Error, Result};
pub use kms::{KmsCtx, KmsRequestKind};
pub use marking::Marking;
pub use options::MasterKeyOpt;
pub use traverse::TraverseMatch;

pub use fieldcrypt_types::{KeyId, Namespace};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
