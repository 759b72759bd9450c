//! One outstanding key-management-service round trip.
//!
//! The core never talks to KMS itself. It parks a [`KmsCtx`] carrying the
//! request payload and the endpoint to reach; the application shuttles the
//! message out, then feeds the reply bytes back in. A decrypt trip's reply is
//! the unwrapped key material; an encrypt trip's reply is the wrapped
//! material for a new data key.

use crate::error::{Error, Result};

/// Hint returned by [`KmsCtx::bytes_needed`] before any reply bytes arrive.
/// Replies are self-delimiting (the application feeds one complete KMS
/// response), so this is only a read-size suggestion.
const REPLY_SIZE_HINT: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsRequestKind {
    /// Unwrap an encrypted data key.
    Decrypt,
    /// Wrap freshly generated data key material.
    Encrypt,
}

#[derive(Debug)]
pub struct KmsCtx {
    kind: KmsRequestKind,
    endpoint: String,
    cmk: Option<String>,
    message: Vec<u8>,
    reply: Vec<u8>,
    complete: bool,
    /// Whether `next_kms_ctx` has already handed this context out.
    pub(crate) yielded: bool,
}

impl KmsCtx {
    pub(crate) fn new(
        kind: KmsRequestKind,
        endpoint: String,
        cmk: Option<String>,
        message: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            endpoint,
            cmk,
            message,
            reply: Vec::new(),
            complete: false,
            yielded: false,
        }
    }

    pub fn kind(&self) -> KmsRequestKind {
        self.kind
    }

    /// Hostname of the service the application must reach for this trip.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The customer master key the service should use, when the provider
    /// names one.
    pub fn cmk(&self) -> Option<&str> {
        self.cmk.as_deref()
    }

    /// The request payload to shuttle out.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Remaining reply bytes wanted. Zero once the reply is complete.
    pub fn bytes_needed(&self) -> u32 {
        if self.complete {
            0
        } else {
            REPLY_SIZE_HINT
        }
    }

    /// Feed the complete reply. Replies are self-delimiting, so one feed
    /// finishes the trip; feeding a completed context is an error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.complete {
            return Err(Error::KeyBroker("KMS reply already complete".into()));
        }
        if bytes.is_empty() {
            return Err(Error::KeyBroker("empty KMS reply chunk".into()));
        }
        self.reply.extend_from_slice(bytes);
        self.complete = true;
        Ok(())
    }

    pub fn done(&self) -> bool {
        self.complete
    }

    /// Take the accumulated reply. Only valid once complete.
    pub(crate) fn take_reply(&mut self) -> Result<Vec<u8>> {
        if !self.complete {
            return Err(Error::KeyBroker("KMS reply not complete".into()));
        }
        Ok(std::mem::take(&mut self.reply))
    }
}

/// Endpoint for an AWS-held master key.
pub(crate) fn aws_endpoint(region: &str) -> String {
    format!("kms.{region}.amazonaws.com")
}
