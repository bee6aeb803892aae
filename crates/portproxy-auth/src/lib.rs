//! Message confidentiality and integrity for the agent command channel
//!
//! Commands and responses travel as [`Envelope`]s: AES-256-CBC ciphertext
//! plus an HMAC-SHA256 tag over the transmitted text fields, both keyed by a
//! PBKDF2-derived key shared between console and agent.

pub mod codec;
pub mod kdf;
pub mod timestamp;

pub use codec::{decrypt, encrypt, AuthFailure, CodecError, MessageCodec};
pub use kdf::{derive_key, DerivedKey, KEY_DERIVATION_ITERATIONS, KEY_DERIVATION_SALT};
pub use timestamp::{format_timestamp, parse_timestamp};

// Re-export useful types
pub use portproxy_proto::Envelope;
