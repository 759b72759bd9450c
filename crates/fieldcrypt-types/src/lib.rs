pub mod key_id;
pub mod namespace;

pub use key_id::KeyId;
pub use namespace::Namespace;
