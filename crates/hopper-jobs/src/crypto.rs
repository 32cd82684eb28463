//! Payload encryption for jobs marked as encrypted.

use crate::error::{JobError, JobResult};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix marking an encrypted payload.
pub const ENCRYPTED_PREFIX: &str = "hopper:enc:v1:";

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher keyed from the application secret.
///
/// Payloads are serialized to JSON, sealed, and stored as a single string
/// `hopper:enc:v1:<base64(nonce || ciphertext)>`.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher {
    /// Derives the key as SHA-256 of `app_key`.
    pub fn new(app_key: &str) -> Self {
        let key = Sha256::digest(app_key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Returns true if `value` looks like an encrypted payload.
    pub fn is_encrypted(value: &Value) -> bool {
        value
            .as_str()
            .is_some_and(|s| s.starts_with(ENCRYPTED_PREFIX))
    }

    /// Seals `value`.
    pub fn encrypt(&self, value: &Value) -> JobResult<Value> {
        let plaintext = serde_json::to_vec(value)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| JobError::PayloadCrypto("payload encryption failed".to_string()))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(Value::String(format!(
            "{}{}",
            ENCRYPTED_PREFIX,
            STANDARD.encode(sealed)
        )))
    }

    /// Opens a payload sealed by [`PayloadCipher::encrypt`] with the same key.
    pub fn decrypt(&self, value: &Value) -> JobResult<Value> {
        let encoded = value
            .as_str()
            .and_then(|s| s.strip_prefix(ENCRYPTED_PREFIX))
            .ok_or_else(|| JobError::PayloadCrypto("payload is not encrypted".to_string()))?;

        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| JobError::PayloadCrypto(format!("malformed payload: {}", e)))?;
        if sealed.len() <= NONCE_LEN {
            return Err(JobError::PayloadCrypto("payload too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| JobError::PayloadCrypto("payload authentication failed".to_string()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| JobError::PayloadCrypto(format!("decrypted payload is not JSON: {}", e)))
    }
}
