//! Encrypted envelope carried over `POST /execute`

use serde::{Deserialize, Serialize};

/// Encrypted, authenticated representation of a command or a response.
///
/// All fields travel as text. The tag covers the exact transmitted strings
/// of `encrypted_data`, `iv` and `timestamp`, so the envelope must not be
/// re-formatted between sealing and verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Base64 AES-256-CBC ciphertext
    pub encrypted_data: String,
    /// Base64 16-byte initialization vector
    #[serde(alias = "IV")]
    pub iv: String,
    /// Base64 HMAC-SHA256 tag
    pub hmac: String,
    /// UTC timestamp in round-trip format (`2024-05-01T10:00:00.0000000Z`)
    pub timestamp: String,
}
