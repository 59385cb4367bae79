//! In-process TTL cache.
//!
//! Backs the snapshot layer in tests and single-process setups where no
//! shared cache is configured. Expiry uses `tokio::time::Instant`, so tests
//! running with a paused clock can advance past a TTL deterministically.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chatrelay_types::error::RepositoryError;
use tokio::time::Instant;

use super::store::CacheStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Mutex-guarded `HashMap` implementing [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut entries)
    }
}

impl CacheStore for MemoryCacheStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RepositoryError> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.with_entries(|entries| entries.insert(key.to_string(), entry));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        let now = Instant::now();
        Ok(self.with_entries(|entries| {
            entries
                .get(key)
                .filter(|entry| entry.is_live(now))
                .map(|entry| entry.value.clone())
        }))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self.with_entries(|entries| {
            entries
                .iter()
                .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
                .map(|(key, _)| key.clone())
                .collect()
        });
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        self.with_entries(|entries| entries.remove(key));
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        let now = Instant::now();
        Ok(self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            (before - entries.len()) as u64
        }))
    }
}
