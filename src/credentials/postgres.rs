//! Postgres-backed `CredentialStore`, grounded on `db.rs`'s pool-and-query
//! style (`sqlx::query_as::<_, T>(..).bind(..)`, no compile-time query
//! checking so this crate builds without a live database), generalized to
//! a single `api_credentials` table per spec §6:
//! `(user_id primary key, access_token, refresh_token, expires_at)`.
//!
//! Token columns store the versioned envelope from [`crate::crypto`];
//! legacy plaintext rows are accepted transparently via
//! [`super::unseal`] and re-encrypted the next time they're written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};

use crate::crypto::CredentialKey;

use super::{seal, unseal, CredentialRecord, CredentialStore, CredentialStoreError};

pub struct PostgresCredentialStore {
    pool: PgPool,
    key: CredentialKey,
}

impl PostgresCredentialStore {
    pub async fn connect(
        database_url: &str,
        key: CredentialKey,
    ) -> Result<Self, CredentialStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| CredentialStoreError::Backend(e.to_string()))?;
        Ok(Self { pool, key })
    }

    pub fn with_pool(pool: PgPool, key: CredentialKey) -> Self {
        Self { pool, key }
    }
}

#[derive(FromRow)]
struct CredentialRow {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn get(&self, user_id: &str) -> Result<CredentialRecord, CredentialStoreError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT access_token, refresh_token, expires_at
            FROM api_credentials
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CredentialStoreError::Backend(e.to_string()))?
        .ok_or_else(|| CredentialStoreError::NotFound(user_id.to_string()))?;

        let access_token = unseal(&self.key, &row.access_token)?;
        let refresh_token = unseal(&self.key, &row.refresh_token)?;

        Ok(CredentialRecord {
            access_token,
            refresh_token,
            expires_at: row.expires_at,
        })
    }

    async fn put(
        &self,
        user_id: &str,
        record: &CredentialRecord,
    ) -> Result<(), CredentialStoreError> {
        let access_token = seal(&self.key, &record.access_token)?;
        let refresh_token = seal(&self.key, &record.refresh_token)?;

        sqlx::query(
            r#"
            INSERT INTO api_credentials (user_id, access_token, refresh_token, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id)
            DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(user_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CredentialStoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), CredentialStoreError> {
        sqlx::query("DELETE FROM api_credentials WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CredentialStoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
