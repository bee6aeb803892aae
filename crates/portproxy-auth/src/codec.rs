//! AES-256-CBC encryption with HMAC-SHA256 authentication

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::kdf::{derive_key, DerivedKey};
use crate::timestamp::{format_timestamp, parse_timestamp};
use portproxy_proto::{Envelope, MESSAGE_EXPIRATION_MINUTES};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Length of the AES initialization vector in bytes
pub const IV_LEN: usize = 16;

/// Why an envelope failed verification.
///
/// Only for local diagnostics; never sent back to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Timestamp could not be parsed
    InvalidTimestamp,
    /// Timestamp is outside the freshness window
    Expired,
    /// Tag is not valid base64
    MalformedTag,
    /// Tag has the wrong length
    TagLengthMismatch,
    /// Tag does not match the recomputed value
    TagMismatch,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuthFailure::InvalidTimestamp => "invalid timestamp",
            AuthFailure::Expired => "message expired",
            AuthFailure::MalformedTag => "malformed HMAC",
            AuthFailure::TagLengthMismatch => "HMAC length mismatch",
            AuthFailure::TagMismatch => "HMAC verification failed",
        };
        f.write_str(text)
    }
}

/// Error types for envelope operations
#[derive(Error, Debug)]
pub enum CodecError {
    /// Tag or freshness check failed. The message is deliberately generic.
    #[error("Message authentication failed")]
    Unauthorized(AuthFailure),

    /// Authentic envelope whose payload could not be decrypted
    #[error("Failed to decrypt message: {0}")]
    Decrypt(String),

    #[error("Failed to encrypt message: {0}")]
    Encrypt(String),
}

impl CodecError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CodecError::Unauthorized(_))
    }
}

/// Seals and opens envelopes for one shared secret.
///
/// The PBKDF2 key is derived once at construction; the codec is immutable
/// afterwards and can be shared freely between concurrent requests.
#[derive(Clone)]
pub struct MessageCodec {
    key: DerivedKey,
    max_age: Duration,
}

impl fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl MessageCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            key: derive_key(secret),
            max_age: Duration::minutes(MESSAGE_EXPIRATION_MINUTES),
        }
    }

    /// Encrypt `plaintext` and stamp it with the current time
    pub fn seal(&self, plaintext: &str) -> Result<Envelope, CodecError> {
        self.seal_at(plaintext, Utc::now())
    }

    /// Encrypt `plaintext` with an explicit timestamp
    pub fn seal_at(&self, plaintext: &str, at: DateTime<Utc>) -> Result<Envelope, CodecError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(self.key.as_bytes(), &iv)
            .map_err(|e| CodecError::Encrypt(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let encrypted_data = STANDARD.encode(ciphertext);
        let iv = STANDARD.encode(iv);
        let timestamp = format_timestamp(at);
        let tag = self
            .tag(&encrypted_data, &iv, &timestamp)
            .map_err(CodecError::Encrypt)?;

        Ok(Envelope {
            encrypted_data,
            iv,
            hmac: STANDARD.encode(tag),
            timestamp,
        })
    }

    /// Verify and decrypt an envelope received now
    pub fn open(&self, envelope: &Envelope) -> Result<String, CodecError> {
        self.open_at(envelope, Utc::now())
    }

    /// Verify and decrypt an envelope as if received at `now`
    pub fn open_at(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<String, CodecError> {
        self.verify(envelope, now)
            .map_err(CodecError::Unauthorized)?;

        let ciphertext = STANDARD
            .decode(&envelope.encrypted_data)
            .map_err(|e| CodecError::Decrypt(format!("invalid ciphertext encoding: {}", e)))?;
        let iv = STANDARD
            .decode(&envelope.iv)
            .map_err(|e| CodecError::Decrypt(format!("invalid IV encoding: {}", e)))?;
        if iv.len() != IV_LEN {
            return Err(CodecError::Decrypt(format!(
                "IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }

        let cipher = Aes256CbcDec::new_from_slices(self.key.as_bytes(), &iv)
            .map_err(|e| CodecError::Decrypt(e.to_string()))?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CodecError::Decrypt("invalid padding or corrupt ciphertext".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CodecError::Decrypt("plaintext is not valid UTF-8".to_string()))
    }

    fn verify(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), AuthFailure> {
        let sent_at = parse_timestamp(&envelope.timestamp).ok_or(AuthFailure::InvalidTimestamp)?;
        let age = now - sent_at;
        if age > self.max_age || age < -self.max_age {
            return Err(AuthFailure::Expired);
        }

        let expected = self
            .tag(&envelope.encrypted_data, &envelope.iv, &envelope.timestamp)
            .map_err(|_| AuthFailure::TagMismatch)?;
        let provided = STANDARD
            .decode(envelope.hmac.trim())
            .map_err(|_| AuthFailure::MalformedTag)?;

        if expected.len() != provided.len() {
            return Err(AuthFailure::TagLengthMismatch);
        }

        if bool::from(expected.ct_eq(&provided)) {
            Ok(())
        } else {
            Err(AuthFailure::TagMismatch)
        }
    }

    /// HMAC over `encrypted_data ∥ iv ∥ timestamp`, exactly as transmitted
    fn tag(&self, encrypted_data: &str, iv: &str, timestamp: &str) -> Result<Vec<u8>, String> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|e| e.to_string())?;
        mac.update(encrypted_data.as_bytes());
        mac.update(iv.as_bytes());
        mac.update(timestamp.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Encrypt `plaintext` for the holder of `secret`
pub fn encrypt(plaintext: &str, secret: &str) -> Result<Envelope, CodecError> {
    MessageCodec::new(secret).seal(plaintext)
}

/// Verify and decrypt an envelope sealed with `secret`
pub fn decrypt(envelope: &Envelope, secret: &str) -> Result<String, CodecError> {
    MessageCodec::new(secret).open(envelope)
}
