//! API keys for the REST surface.
//!
//! Keys are shown to the operator once and stored only as SHA-256 hashes.
//! Each key is bound to one user id; requests authenticated with it act as
//! that user.

use chatrelay_types::error::RepositoryError;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::Row;

use super::pool::DatabasePool;

/// Prefix of every issued key.
pub const KEY_PREFIX: &str = "crly_";

pub struct SqliteApiKeyStore {
    pool: DatabasePool,
}

/// Compute the SHA-256 hash of an API key (lowercase hex).
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{:x}", digest)
}

fn generate_key() -> String {
    let mut key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    format!(
        "{KEY_PREFIX}{}",
        key_bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
    )
}

impl SqliteApiKeyStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Issue a new key for `user_id`. Returns the plaintext key.
    pub async fn create(&self, user_id: i64, name: &str) -> Result<String, RepositoryError> {
        let plaintext_key = generate_key();
        let id = uuid::Uuid::now_v7().to_string();

        sqlx::query(
            "INSERT INTO api_keys (id, key_hash, name, user_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(hash_api_key(&plaintext_key))
        .bind(name)
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::info!(key_id = %id, user_id, "API key created");
        Ok(plaintext_key)
    }

    /// Resolve a plaintext key to its user id, recording the use.
    pub async fn verify(&self, key: &str) -> Result<Option<i64>, RepositoryError> {
        let row = sqlx::query("SELECT id, user_id FROM api_keys WHERE key_hash = ?")
            .bind(hash_api_key(key))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row
            .try_get("id")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let user_id: i64 = row
            .try_get("user_id")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        // Best effort; a failed timestamp update never rejects the request.
        if let Err(e) = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&id)
            .execute(&self.pool.writer)
            .await
        {
            tracing::debug!(key_id = %id, error = %e, "failed to record API key use");
        }

        Ok(Some(user_id))
    }

    pub async fn count(&self) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM api_keys")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        row.try_get("n")
            .map_err(|e| RepositoryError::Query(e.to_string()))
    }
}
