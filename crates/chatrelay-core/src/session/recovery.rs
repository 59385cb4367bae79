//! Startup recovery of durable snapshots.
//!
//! Every live snapshot in the namespace is loaded. Active snapshots that are
//! still fresh are re-admitted to the registry; the pipeline behind them is
//! gone and is not restarted, so they sit until the sweep cancels them or a
//! client reads their replay log. Active snapshots older than the stale
//! threshold are forced to `error` in the durable store and stay out of
//! memory. Terminal snapshots are left untouched.

use chrono::Utc;

use super::record::SessionRecord;
use super::registry::{Admission, SessionRegistry};

/// Counts from one recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Snapshot keys found in the namespace.
    pub scanned: usize,
    /// Active snapshots re-admitted to the registry.
    pub recovered: usize,
    /// Active snapshots forced to `error` because they were stale.
    pub expired: usize,
    /// Snapshots that could not be decoded or were already in memory.
    pub skipped: usize,
}

/// Reload durable snapshots into the registry.
///
/// A cache failure while listing aborts recovery with an empty report; the
/// service starts with an empty registry rather than failing.
pub async fn recover_sessions(registry: &SessionRegistry) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let Some(persistence) = registry.persistence() else {
        return report;
    };

    let entries = match persistence.list_snapshots().await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "session recovery skipped: cache unavailable");
            return report;
        }
    };

    let now = Utc::now();
    for (id, loaded) in entries {
        report.scanned += 1;
        let snapshot = match loaded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "skipping undecodable session snapshot");
                report.skipped += 1;
                continue;
            }
        };

        if snapshot.status.is_terminal() {
            continue;
        }

        let snapshot = registry.expire_if_stale(snapshot, now);
        if snapshot.status.is_terminal() {
            report.expired += 1;
            tracing::info!(session_id = %id, "session expired during recovery");
            if let Err(e) = persistence.save(&snapshot).await {
                tracing::warn!(session_id = %id, error = %e, "failed to persist expired session");
            }
            continue;
        }

        let (record, admission) =
            registry.admit(SessionRecord::restore(snapshot, registry.config()));
        match admission {
            Admission::AlreadyPresent => report.skipped += 1,
            Admission::Admitted => report.recovered += 1,
            Admission::Superseded => {
                report.recovered += 1;
                if let Some(writer) = registry.writer() {
                    writer.submit(record.snapshot());
                }
            }
        }
    }

    tracing::info!(
        scanned = report.scanned,
        recovered = report.recovered,
        expired = report.expired,
        skipped = report.skipped,
        "session recovery finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cache::box_store::BoxCacheStore;
    use crate::cache::memory::MemoryCacheStore;
    use crate::cache::store::CacheStore;
    use crate::session::RECOVERY_EXPIRED_MESSAGE;
    use crate::session::persistence::SnapshotPersistence;
    use crate::session::writer::SnapshotWriter;
    use chatrelay_types::config::SessionConfig;
    use chatrelay_types::llm::ChatMessage;
    use chatrelay_types::session::{SessionSnapshot, SessionStatus};
    use tokio_util::sync::CancellationToken;

    fn registry_over(store: MemoryCacheStore) -> (SessionRegistry, Arc<SnapshotPersistence>) {
        let persistence = Arc::new(SnapshotPersistence::new(
            BoxCacheStore::new(store),
            "chat_session",
            Duration::from_secs(86_400),
        ));
        let (writer, _handle) =
            SnapshotWriter::spawn(persistence.clone(), 2, CancellationToken::new());
        (
            SessionRegistry::new(SessionConfig::default(), writer),
            persistence,
        )
    }

    fn snapshot(conversation_id: i64, status: SessionStatus) -> SessionSnapshot {
        let mut snapshot = SessionRecord::new(
            5,
            conversation_id,
            "m".to_string(),
            vec![ChatMessage::user("q")],
            &SessionConfig::default(),
        )
        .snapshot();
        snapshot.status = status;
        snapshot
    }

    #[tokio::test]
    async fn test_stale_processing_snapshot_is_expired() {
        let (registry, persistence) = registry_over(MemoryCacheStore::new());
        let mut stale = snapshot(1, SessionStatus::Processing);
        stale.last_activity = Utc::now() - chrono::Duration::hours(2);
        stale.total_progress = "partial".to_string();
        persistence.save(&stale).await.unwrap();

        let report = recover_sessions(&registry).await;
        assert_eq!(report.recovered, 0);
        assert_eq!(report.expired, 1);
        assert!(registry.get_session(stale.id).is_none());
        assert!(registry.get_conversation_session(5, 1).is_none());

        let stored = persistence.load(stale.id).await.unwrap().unwrap();
        let view = stored.view();
        assert_eq!(view.status, SessionStatus::Error);
        assert_eq!(view.error.as_deref(), Some(RECOVERY_EXPIRED_MESSAGE));
        assert!(view.completed_at.is_some());
        assert_eq!(view.total_progress, "partial");
    }

    #[tokio::test]
    async fn test_fresh_active_snapshot_is_readmitted() {
        let (registry, persistence) = registry_over(MemoryCacheStore::new());
        let fresh = snapshot(1, SessionStatus::Processing);
        persistence.save(&fresh).await.unwrap();

        let report = recover_sessions(&registry).await;
        assert_eq!(report.recovered, 1);
        assert_eq!(report.expired, 0);

        let active = registry.get_conversation_session(5, 1).unwrap();
        assert_eq!(active.id(), fresh.id);
        assert_eq!(active.status(), SessionStatus::Processing);
        assert!(!active.queues_closed());
    }

    #[tokio::test]
    async fn test_terminal_snapshots_are_left_alone() {
        let (registry, persistence) = registry_over(MemoryCacheStore::new());
        let mut done = snapshot(1, SessionStatus::Completed);
        done.last_activity = Utc::now() - chrono::Duration::hours(5);
        done.result = "ok".to_string();
        persistence.save(&done).await.unwrap();

        let report = recover_sessions(&registry).await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.recovered, 0);
        assert_eq!(report.expired, 0);
        assert!(registry.is_empty());
        assert_eq!(persistence.load(done.id).await.unwrap(), Some(done));
    }

    #[tokio::test]
    async fn test_undecodable_snapshot_is_skipped() {
        let store = MemoryCacheStore::new();
        let bad = uuid::Uuid::now_v7();
        store
            .set(&format!("chat_session:{bad}"), "garbage", Duration::from_secs(60))
            .await
            .unwrap();
        let (registry, persistence) = registry_over(store);
        persistence
            .save(&snapshot(2, SessionStatus::Pending))
            .await
            .unwrap();

        let report = recover_sessions(&registry).await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_is_repeatable() {
        let (registry, persistence) = registry_over(MemoryCacheStore::new());
        persistence
            .save(&snapshot(1, SessionStatus::Pending))
            .await
            .unwrap();

        recover_sessions(&registry).await;
        let second = recover_sessions(&registry).await;
        assert_eq!(second.recovered, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(registry.len(), 1);
    }
}
