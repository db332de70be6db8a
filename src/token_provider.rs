//! Single-flight OAuth token refresh (spec §4.1), grounded on the
//! `Arc<RwLock<HashMap<..>>>` + re-check-after-await shape the teacher uses
//! for upstream connection dedup in `federation/upstream.rs::UpstreamManager`,
//! here applied to per-user refresh locks instead of per-key connections.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    credentials::{CredentialRecord, CredentialStore, CredentialStoreError},
    crypto::redact_for_log,
};

const TOKEN_TTL_SECONDS: i64 = 1200;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no credentials stored for user")]
    NoCredentials,
    #[error("stored credentials are undecipherable")]
    Undecipherable,
    #[error("reauthorization required")]
    RequiresReauth,
    #[error("token endpoint request failed: {0}")]
    TransportError(String),
}

impl From<CredentialStoreError> for TokenError {
    fn from(err: CredentialStoreError) -> Self {
        match err {
            CredentialStoreError::NotFound(_) => TokenError::NoCredentials,
            CredentialStoreError::Undecipherable => TokenError::Undecipherable,
            CredentialStoreError::Backend(msg) => TokenError::TransportError(msg),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// Yields valid access tokens per user, refreshing and persisting through a
/// [`CredentialStore`]. Concurrent `refresh` calls for the same user share
/// one underlying token-endpoint POST.
pub struct TokenProvider {
    store: Arc<dyn CredentialStore>,
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenProvider {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        http: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the currently stored access token without attempting a
    /// refresh, even if it is expired — callers that need a live token
    /// should prefer [`Self::refresh`] once they observe a 401.
    pub async fn get_token(&self, user_id: &str) -> Result<String, TokenError> {
        let record = self.store.get(user_id).await?;
        Ok(record.access_token)
    }

    /// Exchanges the stored refresh token for a new access token. Single
    /// flight per user: a caller that loses the race to acquire the
    /// per-user lock simply waits for the winner's result rather than
    /// issuing its own POST.
    pub async fn refresh(&self, user_id: &str) -> Result<(String, DateTime<Utc>), TokenError> {
        let lock = self.lock_for(user_id).await;
        let _guard = lock.lock().await;

        // Re-read after acquiring the lock: another caller may have just
        // completed a refresh while we were waiting.
        let current = self.store.get(user_id).await?;

        self.do_refresh(user_id, &current).await
    }

    async fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.refresh_locks.read().await.get(user_id) {
            return lock.clone();
        }
        let mut locks = self.refresh_locks.write().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn do_refresh(
        &self,
        user_id: &str,
        current: &CredentialRecord,
    ) -> Result<(String, DateTime<Utc>), TokenError> {
        let body = json!({
            "grant_type": "refresh_token",
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "refresh_token": current.refresh_token,
        });

        let response = self
            .http
            .post(&self.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TokenError::TransportError(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let parsed: TokenErrorResponse = response.json().await.unwrap_or_default();
            let is_client_id_mismatch = parsed
                .error_description
                .as_deref()
                .map(|d| d.contains("client associated with this refresh token"))
                .unwrap_or(false);

            if status.as_u16() == 401
                || parsed.error.as_deref() == Some("invalid_grant") && is_client_id_mismatch
            {
                warn!(
                    user_id = %redact_for_log(user_id),
                    status = status.as_u16(),
                    "token refresh rejected, purging credentials"
                );
                let _ = self.store.delete(user_id).await;
                crate::metrics::record_token_refresh("reauth_required");
                return Err(TokenError::RequiresReauth);
            }

            debug!(
                user_id = %redact_for_log(user_id),
                status = status.as_u16(),
                "token refresh failed, credentials preserved"
            );
            crate::metrics::record_token_refresh("transport_error");
            return Err(TokenError::TransportError(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::TransportError(e.to_string()))?;

        let expires_at = Utc::now() + ChronoDuration::seconds(TOKEN_TTL_SECONDS);
        let updated = CredentialRecord {
            access_token: parsed.access_token.clone(),
            refresh_token: parsed.refresh_token.unwrap_or_else(|| current.refresh_token.clone()),
            expires_at,
        };
        self.store.put(user_id, &updated).await?;
        crate::metrics::record_token_refresh("success");

        Ok((parsed.access_token, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::memory::InMemoryCredentialStore;

    fn make_provider(store: Arc<InMemoryCredentialStore>, token_url: String) -> TokenProvider {
        TokenProvider::new(
            store,
            Client::new(),
            token_url,
            "client-id".to_string(),
            "client-secret".to_string(),
        )
    }

    #[tokio::test]
    async fn get_token_without_credentials_fails_with_no_credentials() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let provider = make_provider(store, "http://localhost:1/oauth/token".into());
        assert!(matches!(
            provider.get_token("user-1").await,
            Err(TokenError::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn get_token_returns_stored_access_token() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store
            .put(
                "user-1",
                &CredentialRecord {
                    access_token: "abc".into(),
                    refresh_token: "def".into(),
                    expires_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        let provider = make_provider(store, "http://localhost:1/oauth/token".into());
        assert_eq!(provider.get_token("user-1").await.unwrap(), "abc");
    }
}
