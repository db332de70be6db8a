//! Log redaction and credential-at-rest encryption.
//!
//! `hash_for_log`/`redact_for_log` are carried over from the teacher's
//! `crypto.rs` near-verbatim. The AEAD envelope is new: spec §4.1 requires
//! a versioned `(iv, tag, ciphertext)` encoding for stored tokens, with
//! transparent fallback to legacy plaintext on read.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

/// Hash a value for logging/privacy (8-byte truncated SHA256).
pub fn hash_for_log(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    format!(
        "{:x}",
        &result[..8]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64)
    )
}

/// Redact a sensitive value for logs by returning a short, non-reversible tag.
pub fn redact_for_log(value: &str) -> String {
    format!("h:{}", hash_for_log(value))
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialCryptoError {
    #[error("encryption key must be 32 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("invalid key encoding: {0}")]
    BadKeyEncoding(String),
    #[error("envelope too short to contain a nonce")]
    EnvelopeTooShort,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("AEAD operation failed")]
    Aead,
    #[error("invalid base64 envelope: {0}")]
    BadEnvelopeEncoding(String),
}

/// A 32-byte AEAD key, parsed once at startup from hex or base64.
#[derive(Clone)]
pub struct CredentialKey(Key<Aes256Gcm>);

impl CredentialKey {
    pub fn from_config_str(raw: &str) -> Result<Self, CredentialCryptoError> {
        let bytes = if let Ok(b) = hex::decode(raw) {
            b
        } else {
            STANDARD
                .decode(raw)
                .map_err(|e| CredentialCryptoError::BadKeyEncoding(e.to_string()))?
        };
        if bytes.len() != 32 {
            return Err(CredentialCryptoError::BadKeyLength(bytes.len()));
        }
        Ok(Self(*Key::<Aes256Gcm>::from_slice(&bytes)))
    }

    /// A fresh random key, useful for tests and for `CredentialStore`
    /// in-memory test doubles that don't care about persistence.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(*Key::<Aes256Gcm>::from_slice(&bytes))
    }
}

/// Encrypt `plaintext`, returning a versioned, base64-encoded envelope:
/// `version(1) || nonce(12) || ciphertext+tag`.
pub fn encrypt(key: &CredentialKey, plaintext: &str) -> Result<String, CredentialCryptoError> {
    let cipher = Aes256Gcm::new(&key.0);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CredentialCryptoError::Aead)?;

    let mut envelope = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(envelope))
}

/// Decrypt a versioned envelope produced by [`encrypt`]. Callers that need
/// to accept legacy plaintext rows should try this first and fall back to
/// treating the raw stored value as plaintext on [`CredentialCryptoError`].
pub fn decrypt(key: &CredentialKey, envelope_b64: &str) -> Result<String, CredentialCryptoError> {
    let envelope = STANDARD
        .decode(envelope_b64)
        .map_err(|e| CredentialCryptoError::BadEnvelopeEncoding(e.to_string()))?;

    if envelope.len() < 1 + NONCE_LEN {
        return Err(CredentialCryptoError::EnvelopeTooShort);
    }

    let version = envelope[0];
    if version != ENVELOPE_VERSION {
        return Err(CredentialCryptoError::UnsupportedVersion(version));
    }

    let nonce = Nonce::from_slice(&envelope[1..1 + NONCE_LEN]);
    let ciphertext = &envelope[1 + NONCE_LEN..];

    let cipher = Aes256Gcm::new(&key.0);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CredentialCryptoError::Aead)?;

    String::from_utf8(plaintext).map_err(|_| CredentialCryptoError::Aead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_for_log() {
        let hash = hash_for_log("test-user-id");
        assert_eq!(hash.len(), 16);
    }

    #[test]
    fn roundtrips_through_encrypt_decrypt() {
        let key = CredentialKey::generate();
        let envelope = encrypt(&key, "super-secret-refresh-token").unwrap();
        let plaintext = decrypt(&key, &envelope).unwrap();
        assert_eq!(plaintext, "super-secret-refresh-token");
    }

    #[test]
    fn different_keys_cannot_decrypt_each_others_envelopes() {
        let key_a = CredentialKey::generate();
        let key_b = CredentialKey::generate();
        let envelope = encrypt(&key_a, "secret").unwrap();
        assert!(decrypt(&key_b, &envelope).is_err());
    }

    #[test]
    fn rejects_short_envelope() {
        let key = CredentialKey::generate();
        assert!(matches!(
            decrypt(&key, &STANDARD.encode([1u8, 2, 3])),
            Err(CredentialCryptoError::EnvelopeTooShort)
        ));
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(matches!(
            CredentialKey::from_config_str("deadbeef"),
            Err(CredentialCryptoError::BadKeyLength(_))
        ));
    }
}
