//! The storage contract from spec §4.1: a credential record per user
//! `(access_token, refresh_token, expires_at)`, encrypted at rest, with
//! legacy plaintext accepted on read and re-encrypted on next write.
//!
//! The multiplexer consumes only [`CredentialStore`] — the concrete
//! backing (Postgres schema, migrations) is the external collaborator
//! spec §1 excludes from this crate's scope.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crypto::{decrypt, encrypt, CredentialCryptoError, CredentialKey};

#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("no credentials stored for user {0}")]
    NotFound(String),
    #[error("credential record is undecipherable")]
    Undecipherable,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// External storage for encrypted OAuth credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<CredentialRecord, CredentialStoreError>;

    async fn put(
        &self,
        user_id: &str,
        record: &CredentialRecord,
    ) -> Result<(), CredentialStoreError>;

    async fn delete(&self, user_id: &str) -> Result<(), CredentialStoreError>;
}

/// Encrypts a plaintext token using the configured key; stored rows carry
/// the versioned envelope described in spec §4.1.
pub fn seal(key: &CredentialKey, plaintext: &str) -> Result<String, CredentialStoreError> {
    encrypt(key, plaintext).map_err(|e| CredentialStoreError::Backend(e.to_string()))
}

/// Decrypts a stored value, falling back to treating it as legacy
/// plaintext if it doesn't parse as a versioned envelope at all. A value
/// that *does* carry our version byte but fails AEAD is genuinely corrupt
/// ciphertext, not an unencrypted legacy row, and must surface as
/// [`CredentialStoreError::Undecipherable`] rather than be handed to the
/// upstream as a bogus token.
pub fn unseal(key: &CredentialKey, stored: &str) -> Result<String, CredentialStoreError> {
    match decrypt(key, stored) {
        Ok(plaintext) => Ok(plaintext),
        Err(CredentialCryptoError::Aead) => Err(CredentialStoreError::Undecipherable),
        Err(_) => Ok(stored.to_string()),
    }
}
