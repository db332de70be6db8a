//! In-memory `CredentialStore`, grounded on `middleware/rate_limit.rs`'s
//! `Arc<DashMap<String, TokenBucket>>` shape. Used by tests and by the
//! token-provider test doubles in `mux` integration tests.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CredentialRecord, CredentialStore, CredentialStoreError};

#[derive(Default)]
pub struct InMemoryCredentialStore {
    records: DashMap<String, CredentialRecord>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, user_id: &str) -> Result<CredentialRecord, CredentialStoreError> {
        self.records
            .get(user_id)
            .map(|r| r.clone())
            .ok_or_else(|| CredentialStoreError::NotFound(user_id.to_string()))
    }

    async fn put(
        &self,
        user_id: &str,
        record: &CredentialRecord,
    ) -> Result<(), CredentialStoreError> {
        self.records.insert(user_id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), CredentialStoreError> {
        self.records.remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = InMemoryCredentialStore::new();
        let record = CredentialRecord {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now(),
        };
        store.put("user-1", &record).await.unwrap();
        let fetched = store.get("user-1").await.unwrap();
        assert_eq!(fetched.access_token, "a");
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let store = InMemoryCredentialStore::new();
        assert!(matches!(
            store.get("nobody").await,
            Err(CredentialStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = InMemoryCredentialStore::new();
        let record = CredentialRecord {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now(),
        };
        store.put("user-1", &record).await.unwrap();
        store.delete("user-1").await.unwrap();
        assert!(store.get("user-1").await.is_err());
    }
}
