//! CacheStore trait definition.

use std::time::Duration;

use chatrelay_types::error::RepositoryError;

/// Trait for a shared key-value cache whose entries expire after a TTL.
///
/// Values are opaque strings (session snapshots are stored as JSON).
/// Implementations must never return an expired value.
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
/// Implementations live in chatrelay-infra, plus [`super::memory::MemoryCacheStore`].
pub trait CacheStore: Send + Sync {
    /// Set a value (upsert), replacing any previous TTL.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a live value. Returns None if the key is missing or expired.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, RepositoryError>> + Send;

    /// List live keys starting with `prefix`, sorted.
    fn keys(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Delete a key. No-op if the key does not exist.
    fn delete(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove every expired entry. Returns how many were removed.
    fn purge_expired(
        &self,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
