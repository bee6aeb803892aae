//! Key derivation using PBKDF2-HMAC-SHA256

use sha2::Sha256;
use std::fmt;

/// Fixed salt shared by every console and agent
pub const KEY_DERIVATION_SALT: &[u8] = b"PortProxyAgent.Salt.2024";

/// PBKDF2 iteration count
pub const KEY_DERIVATION_ITERATIONS: u32 = 10_000;

/// Length of the derived key in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// 256-bit key derived from a shared secret.
///
/// The same key drives both AES encryption and the HMAC tag.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Derive the channel key from a shared secret
///
/// # Arguments
/// * `secret` - The agent secret configured on both console and agent
///
/// # Example
/// ```
/// use portproxy_auth::kdf::derive_key;
///
/// let key = derive_key("my-agent-secret");
/// assert_eq!(key.as_bytes().len(), 32);
/// ```
pub fn derive_key(secret: &str) -> DerivedKey {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        secret.as_bytes(),
        KEY_DERIVATION_SALT,
        KEY_DERIVATION_ITERATIONS,
        &mut key,
    );
    DerivedKey(key)
}
