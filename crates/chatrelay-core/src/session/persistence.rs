//! Durable session snapshots in the TTL cache.
//!
//! Each snapshot is stored as JSON under `{namespace}:{session_id}` with the
//! configured retention as TTL. Writes are idempotent upserts keyed by id.

use std::time::Duration;

use chatrelay_types::error::RepositoryError;
use chatrelay_types::session::SessionSnapshot;
use uuid::Uuid;

use crate::cache::box_store::BoxCacheStore;

#[derive(Debug)]
pub struct SnapshotPersistence {
    store: BoxCacheStore,
    namespace: String,
    ttl: Duration,
}

impl SnapshotPersistence {
    pub fn new(store: BoxCacheStore, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    pub fn key(&self, id: Uuid) -> String {
        format!("{}:{}", self.namespace, id)
    }

    /// Upsert the snapshot, resetting its TTL.
    pub async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        self.store.set(&self.key(snapshot.id), &json, self.ttl).await
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<SessionSnapshot>, RepositoryError> {
        let Some(json) = self.store.get(&self.key(id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.store.delete(&self.key(id)).await
    }

    /// Ids of every live snapshot in the namespace. Keys whose suffix is
    /// not a UUID are ignored.
    pub async fn list_ids(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let prefix = self.prefix();
        let keys = self.store.keys(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|suffix| Uuid::parse_str(suffix).ok())
            .collect())
    }

    /// Every live snapshot, decoded. Entries that fail to decode come back
    /// as `Err` alongside their key so callers can count and skip them.
    pub async fn list_snapshots(
        &self,
    ) -> Result<Vec<(Uuid, Result<SessionSnapshot, RepositoryError>)>, RepositoryError> {
        let ids = self.list_ids().await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id).await {
                Ok(Some(snapshot)) => out.push((id, Ok(snapshot))),
                // Expired between listing and loading.
                Ok(None) => {}
                Err(e) => out.push((id, Err(e))),
            }
        }
        Ok(out)
    }

    pub async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        self.store.purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCacheStore;
    use crate::cache::store::CacheStore;
    use crate::session::record::SessionRecord;
    use chatrelay_types::config::SessionConfig;
    use chatrelay_types::llm::ChatMessage;

    fn persistence() -> SnapshotPersistence {
        SnapshotPersistence::new(
            BoxCacheStore::new(MemoryCacheStore::new()),
            "chat_session",
            Duration::from_secs(86_400),
        )
    }

    fn snapshot() -> SessionSnapshot {
        SessionRecord::new(
            1,
            2,
            "m".to_string(),
            vec![ChatMessage::user("q")],
            &SessionConfig::default(),
        )
        .snapshot()
    }

    #[tokio::test]
    async fn test_key_format() {
        let p = persistence();
        let id = Uuid::now_v7();
        assert_eq!(p.key(id), format!("chat_session:{id}"));
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let p = persistence();
        let snap = snapshot();
        p.save(&snap).await.unwrap();
        p.save(&snap).await.unwrap();

        assert_eq!(p.list_ids().await.unwrap(), vec![snap.id]);
        assert_eq!(p.load(snap.id).await.unwrap(), Some(snap));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_reported_not_fatal() {
        let store = MemoryCacheStore::new();
        let bad = Uuid::now_v7();
        store
            .set(&format!("chat_session:{bad}"), "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set("chat_session:not-a-uuid", "{}", Duration::from_secs(60))
            .await
            .unwrap();
        let p = SnapshotPersistence::new(
            BoxCacheStore::new(store),
            "chat_session",
            Duration::from_secs(60),
        );
        let good = snapshot();
        p.save(&good).await.unwrap();

        let listed = p.list_snapshots().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed.iter().filter(|(_, r)| r.is_err()).count(), 1);
    }
}
