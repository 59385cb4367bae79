//! SQLite-backed TTL cache.
//!
//! Implements `CacheStore` from `chatrelay-core`. Expiry is stored as a unix
//! millisecond timestamp; every read filters on it, so an expired row is
//! invisible even before `purge_expired` deletes it.

use std::time::Duration;

use chatrelay_core::cache::store::CacheStore;
use chatrelay_types::error::RepositoryError;
use chrono::Utc;
use sqlx::Row;

use super::pool::DatabasePool;

pub struct SqliteCacheStore {
    pool: DatabasePool,
}

impl SqliteCacheStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl_ms)
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

impl CacheStore for SqliteCacheStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO cache_entries (key, value, expires_at, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_millis(ttl))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM cache_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| row.try_get::<String, _>("value").map_err(query_err))
            .transpose()
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        // substr comparison instead of LIKE, so '%' and '_' in the prefix are literal.
        let rows = sqlx::query(
            "SELECT key FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1 AND expires_at > ?2 ORDER BY key",
        )
        .bind(prefix)
        .bind(now_millis())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(query_err))
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected())
    }
}
