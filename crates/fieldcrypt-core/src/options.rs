//! Per-context options and the allow/require/forbid matrix applied at init.

use bson::Document;
use fieldcrypt_types::KeyId;

use crate::crypto::{Algorithm, IV_LEN};
use crate::error::{Error, Result};

/// Which master key wraps a new data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterKeyOpt {
    Local,
    Aws { region: String, cmk: String },
}

/// Options set on a context before init. Different context types accept,
/// require, or forbid different fields; see [`OptsSpec`].
#[derive(Default, Clone)]
pub struct CtxOpts {
    pub(crate) masterkey: Option<MasterKeyOpt>,
    pub(crate) local_schema: Option<Document>,
    pub(crate) key_id: Option<KeyId>,
    pub(crate) key_alt_name: Option<String>,
    pub(crate) iv: Option<[u8; IV_LEN]>,
    pub(crate) algorithm: Option<Algorithm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OptReq {
    Prohibited,
    Required,
    Optional,
}

/// The option matrix for one context type.
pub(crate) struct OptsSpec {
    pub masterkey: OptReq,
    pub schema: OptReq,
    /// A key id or key alt name.
    pub key_descriptor: OptReq,
    pub iv: OptReq,
    pub algorithm: OptReq,
}

impl OptsSpec {
    /// All fields prohibited; contexts opt fields in from here.
    pub fn prohibit_all() -> Self {
        Self {
            masterkey: OptReq::Prohibited,
            schema: OptReq::Prohibited,
            key_descriptor: OptReq::Prohibited,
            iv: OptReq::Prohibited,
            algorithm: OptReq::Prohibited,
        }
    }

    /// Validate `opts` against this spec. `label` names the context type in
    /// messages, e.g. "auto encryption". The key descriptor is reported
    /// first: a context that names no key has nothing to apply the other
    /// options to.
    pub fn validate(&self, opts: &CtxOpts, label: &str) -> Result<()> {
        // The key descriptor is either field, never both.
        if opts.key_id.is_some() && opts.key_alt_name.is_some() {
            return Err(Error::ClientInput(
                "cannot set both key_id and key_alt_name".into(),
            ));
        }
        match self.key_descriptor {
            OptReq::Prohibited => {
                if opts.key_id.is_some() {
                    return Err(Error::ClientInput(format!(
                        "key_id must not be set for {label}"
                    )));
                }
                if opts.key_alt_name.is_some() {
                    return Err(Error::ClientInput(format!(
                        "key_alt_name must not be set for {label}"
                    )));
                }
            }
            OptReq::Required => {
                if opts.key_id.is_none() && opts.key_alt_name.is_none() {
                    return Err(Error::ClientInput(format!(
                        "either key_id or key_alt_name required for {label}"
                    )));
                }
            }
            OptReq::Optional => {}
        }

        check(self.masterkey, opts.masterkey.is_some(), "masterkey", label)?;
        check(self.schema, opts.local_schema.is_some(), "schema", label)?;
        check(self.iv, opts.iv.is_some(), "iv", label)?;
        check(self.algorithm, opts.algorithm.is_some(), "algorithm", label)?;
        Ok(())
    }
}

fn check(req: OptReq, set: bool, field: &str, label: &str) -> Result<()> {
    match req {
        OptReq::Prohibited if set => Err(Error::ClientInput(format!(
            "{field} must not be set for {label}"
        ))),
        OptReq::Required if !set => Err(Error::ClientInput(format!(
            "{field} required for {label}"
        ))),
        _ => Ok(()),
    }
}
