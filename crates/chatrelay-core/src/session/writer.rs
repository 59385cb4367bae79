//! Background snapshot writer.
//!
//! Foreground operations never await the durable cache. They submit a
//! snapshot to an unbounded queue and return. A single worker drains the
//! queue in batches: snapshots for the same session id within a batch are
//! coalesced to the newest one, and the batch is written with bounded
//! concurrency via a `Semaphore` + `JoinSet`. Batches are written one after
//! another, so writes for one id land in submission order.
//!
//! Failures are logged and counted, never propagated.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatrelay_types::session::SessionSnapshot;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::persistence::SnapshotPersistence;

enum WriteCommand {
    Save(SessionSnapshot),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
}

/// Point-in-time writer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterStats {
    pub written: u64,
    pub failed: u64,
    /// Snapshots superseded by a newer one for the same id before writing.
    pub coalesced: u64,
}

/// Handle for submitting snapshots. Cheap to clone.
#[derive(Clone)]
pub struct SnapshotWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
    counters: Arc<Counters>,
    persistence: Arc<SnapshotPersistence>,
}

impl SnapshotWriter {
    /// Start the worker. It drains everything already queued and exits once
    /// `shutdown` fires.
    pub fn spawn(
        persistence: Arc<SnapshotPersistence>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            persistence: persistence.clone(),
            counters: counters.clone(),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        };
        let handle = tokio::spawn(worker.run(rx, shutdown));
        (
            Self {
                tx,
                counters,
                persistence,
            },
            handle,
        )
    }

    /// Queue a snapshot for writing. Never blocks.
    pub fn submit(&self, snapshot: SessionSnapshot) {
        let id = snapshot.id;
        if self.tx.send(WriteCommand::Save(snapshot)).is_err() {
            tracing::debug!(session_id = %id, "snapshot writer stopped, dropping snapshot");
        }
    }

    /// Wait until everything submitted before this call has been written
    /// (or has failed). Returns immediately if the worker has stopped.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }

    pub fn persistence(&self) -> &Arc<SnapshotPersistence> {
        &self.persistence
    }
}

impl std::fmt::Debug for SnapshotWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotWriter")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Batch {
    order: Vec<Uuid>,
    latest: HashMap<Uuid, SessionSnapshot>,
    flushes: Vec<oneshot::Sender<()>>,
}

impl Batch {
    fn absorb(&mut self, cmd: WriteCommand, counters: &Counters) {
        match cmd {
            WriteCommand::Save(snapshot) => {
                let id = snapshot.id;
                if self.latest.insert(id, snapshot).is_some() {
                    counters.coalesced.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.order.push(id);
                }
            }
            WriteCommand::Flush(done) => self.flushes.push(done),
        }
    }
}

struct Worker {
    persistence: Arc<SnapshotPersistence>,
    counters: Arc<Counters>,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<WriteCommand>, shutdown: CancellationToken) {
        loop {
            let first = tokio::select! {
                cmd = rx.recv() => cmd,
                _ = shutdown.cancelled() => None,
            };
            let Some(first) = first else { break };

            let mut batch = Batch::default();
            batch.absorb(first, &self.counters);
            while let Ok(cmd) = rx.try_recv() {
                batch.absorb(cmd, &self.counters);
            }
            self.write(batch).await;
        }

        rx.close();
        let mut batch = Batch::default();
        while let Ok(cmd) = rx.try_recv() {
            batch.absorb(cmd, &self.counters);
        }
        let pending = batch.order.len();
        self.write(batch).await;
        tracing::debug!(drained = pending, "snapshot writer stopped");
    }

    async fn write(&self, mut batch: Batch) {
        let mut join_set = JoinSet::new();
        for id in batch.order.drain(..) {
            let Some(snapshot) = batch.latest.remove(&id) else {
                continue;
            };
            let persistence = self.persistence.clone();
            let semaphore = self.semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (id, persistence.save(&snapshot).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {
                    self.counters.written.fetch_add(1, Ordering::Relaxed);
                }
                Ok((id, Err(e))) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(session_id = %id, error = %e, "failed to persist session snapshot");
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, "snapshot write task failed");
                }
            }
        }

        for done in batch.flushes {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::box_store::BoxCacheStore;
    use crate::cache::memory::MemoryCacheStore;
    use crate::session::record::SessionRecord;
    use chatrelay_types::config::SessionConfig;
    use chatrelay_types::error::RepositoryError;
    use chatrelay_types::llm::ChatMessage;
    use chatrelay_types::session::SessionStatus;

    use crate::cache::store::CacheStore;

    fn persistence() -> Arc<SnapshotPersistence> {
        Arc::new(SnapshotPersistence::new(
            BoxCacheStore::new(MemoryCacheStore::new()),
            "chat_session",
            Duration::from_secs(60),
        ))
    }

    fn record() -> SessionRecord {
        SessionRecord::new(
            1,
            1,
            "m".to_string(),
            vec![ChatMessage::user("q")],
            &SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_flush_waits_for_writes() {
        let persistence = persistence();
        let (writer, _handle) =
            SnapshotWriter::spawn(persistence.clone(), 2, CancellationToken::new());

        let record = record();
        writer.submit(record.snapshot());
        writer.flush().await;

        let loaded = persistence.load(record.id()).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Pending);
        assert_eq!(writer.stats().written, 1);
    }

    #[tokio::test]
    async fn test_last_submission_wins() {
        let persistence = persistence();
        let (writer, _handle) =
            SnapshotWriter::spawn(persistence.clone(), 4, CancellationToken::new());

        let record = record();
        for fragment in ["a", "b", "c"] {
            record.append_progress(fragment);
            writer.submit(record.snapshot());
        }
        writer.flush().await;

        let loaded = persistence.load(record.id()).await.unwrap().unwrap();
        assert_eq!(loaded.total_progress, "abc");
        let stats = writer.stats();
        assert_eq!(stats.written + stats.coalesced, 3);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let persistence = persistence();
        let shutdown = CancellationToken::new();
        let (writer, handle) = SnapshotWriter::spawn(persistence.clone(), 1, shutdown.clone());

        let record = record();
        writer.submit(record.snapshot());
        shutdown.cancel();
        handle.await.unwrap();

        assert!(persistence.load(record.id()).await.unwrap().is_some());
        // Worker gone: flush returns instead of hanging.
        writer.flush().await;
    }

    struct FailingStore;

    impl CacheStore for FailingStore {
        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), RepositoryError> {
            Err(RepositoryError::Connection)
        }
        async fn get(&self, _: &str) -> Result<Option<String>, RepositoryError> {
            Err(RepositoryError::Connection)
        }
        async fn keys(&self, _: &str) -> Result<Vec<String>, RepositoryError> {
            Err(RepositoryError::Connection)
        }
        async fn delete(&self, _: &str) -> Result<(), RepositoryError> {
            Err(RepositoryError::Connection)
        }
        async fn purge_expired(&self) -> Result<u64, RepositoryError> {
            Err(RepositoryError::Connection)
        }
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let persistence = Arc::new(SnapshotPersistence::new(
            BoxCacheStore::new(FailingStore),
            "chat_session",
            Duration::from_secs(60),
        ));
        let (writer, _handle) = SnapshotWriter::spawn(persistence, 1, CancellationToken::new());

        writer.submit(record().snapshot());
        writer.flush().await;
        assert_eq!(writer.stats().failed, 1);
    }
}
