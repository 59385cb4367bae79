//! BoxCacheStore -- object-safe dynamic dispatch wrapper for CacheStore.
//!
//! Same blanket-impl pattern as the other boxed ports:
//! 1. Define an object-safe `CacheStoreDyn` trait with boxed futures
//! 2. Blanket-impl `CacheStoreDyn` for all `T: CacheStore`
//! 3. `BoxCacheStore` wraps `Box<dyn CacheStoreDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chatrelay_types::error::RepositoryError;

use super::store::CacheStore;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Object-safe version of [`CacheStore`] with boxed futures.
pub trait CacheStoreDyn: Send + Sync {
    fn set_boxed<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BoxFuture<'a, ()>;

    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>>;

    fn keys_boxed<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>>;

    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;

    fn purge_expired_boxed(&self) -> BoxFuture<'_, u64>;
}

impl<T: CacheStore> CacheStoreDyn for T {
    fn set_boxed<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BoxFuture<'a, ()> {
        Box::pin(self.set(key, value, ttl))
    }

    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(self.get(key))
    }

    fn keys_boxed<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(self.keys(prefix))
    }

    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.delete(key))
    }

    fn purge_expired_boxed(&self) -> BoxFuture<'_, u64> {
        Box::pin(self.purge_expired())
    }
}

/// Type-erased cache store, so the session layer does not carry the
/// concrete backend as a generic parameter.
pub struct BoxCacheStore {
    inner: Box<dyn CacheStoreDyn>,
}

impl BoxCacheStore {
    pub fn new<T: CacheStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RepositoryError> {
        self.inner.set_boxed(key, value, ttl).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        self.inner.get_boxed(key).await
    }

    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        self.inner.keys_boxed(prefix).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        self.inner.delete_boxed(key).await
    }

    pub async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        self.inner.purge_expired_boxed().await
    }
}

impl std::fmt::Debug for BoxCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCacheStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCacheStore;

    #[tokio::test]
    async fn test_boxed_store_delegates() {
        let store = BoxCacheStore::new(MemoryCacheStore::new());
        store.set("a:1", "one", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("a:1").await.unwrap().as_deref(), Some("one"));
        assert_eq!(store.keys("a:").await.unwrap(), vec!["a:1"]);
        store.delete("a:1").await.unwrap();
        assert!(store.get("a:1").await.unwrap().is_none());
    }
}
