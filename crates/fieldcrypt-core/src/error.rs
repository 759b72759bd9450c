use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the driver core.
///
/// Contexts latch the first error they hit: every later call on a failed
/// context returns a clone of the recorded status, so variants stay `Clone`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed caller input: bad namespace, missing `v`, option-spec
    /// violations, views. The message is the full text.
    #[error("{0}")]
    ClientInput(String),

    #[error("malformed BSON: {0}")]
    MalformedBson(String),

    #[error("malformed ciphertext, {0}")]
    MalformedCiphertext(String),

    #[error("malformed marking, {0}")]
    MalformedMarking(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("key broker error: {0}")]
    KeyBroker(String),

    #[error("cache error: {0}")]
    Cache(String),
}

impl From<bson::ser::Error> for Error {
    fn from(value: bson::ser::Error) -> Self {
        Error::MalformedBson(value.to_string())
    }
}

impl From<bson::de::Error> for Error {
    fn from(value: bson::de::Error) -> Self {
        Error::MalformedBson(value.to_string())
    }
}
