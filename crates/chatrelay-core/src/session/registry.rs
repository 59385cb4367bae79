//! In-memory session registry.
//!
//! The registry is the authoritative copy of every live session. It owns
//! three indices under one lock: sessions by id, the active session of each
//! `(user, conversation)` pair, and session ids by user. Every terminal
//! transition goes through [`SessionRegistry::finish`], which is what makes
//! a session terminal at most once.
//!
//! Lock order: registry lock first, then a record's own lock. Queue offers
//! and durable writes always happen with no lock held.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chatrelay_types::config::SessionConfig;
use chatrelay_types::error::SessionError;
use chatrelay_types::llm::{ChatMessage, Chunk, GenerationParams};
use chatrelay_types::session::{SessionSnapshot, SessionStatus};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::persistence::SnapshotPersistence;
use super::record::{SessionRecord, Terminal};
use super::writer::SnapshotWriter;
use super::{RECOVERY_EXPIRED_MESSAGE, SUPERSEDED_MESSAGE};
use crate::delivery::observer::Observer;

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<Uuid, Arc<SessionRecord>>,
    active_by_conversation: HashMap<(i64, i64), Uuid>,
    by_user: HashMap<i64, HashSet<Uuid>>,
}

impl RegistryInner {
    fn insert(&mut self, record: Arc<SessionRecord>) {
        let id = record.id();
        if record.status().is_active() {
            self.active_by_conversation
                .insert((record.user_id(), record.conversation_id()), id);
        }
        self.by_user.entry(record.user_id()).or_default().insert(id);
        self.sessions.insert(id, record);
    }

    fn remove(&mut self, id: Uuid) -> Option<Arc<SessionRecord>> {
        let record = self.sessions.remove(&id)?;
        let key = (record.user_id(), record.conversation_id());
        if self.active_by_conversation.get(&key) == Some(&id) {
            self.active_by_conversation.remove(&key);
        }
        if let Some(ids) = self.by_user.get_mut(&record.user_id()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(&record.user_id());
            }
        }
        Some(record)
    }

    /// The active session for the pair, if its record is still active.
    fn active_for(&self, user_id: i64, conversation_id: i64) -> Option<&Arc<SessionRecord>> {
        self.active_by_conversation
            .get(&(user_id, conversation_id))
            .and_then(|id| self.sessions.get(id))
            .filter(|record| record.status().is_active())
    }
}

/// Outcome of admitting a restored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// A newer active session owns the conversation; the restored record was
    /// forced to `error` before admission.
    Superseded,
    /// A record with this id was already in memory and was returned as is.
    AlreadyPresent,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Stale active sessions moved to `cancelled`.
    pub cancelled: usize,
    /// Stale sessions removed from memory (including the cancelled ones).
    pub evicted: usize,
}

pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    config: SessionConfig,
    writer: Option<SnapshotWriter>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, writer: SnapshotWriter) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            config,
            writer: Some(writer),
        }
    }

    /// A registry with no durable layer. Snapshots are simply not written.
    pub fn detached(config: SessionConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            config,
            writer: None,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn writer(&self) -> Option<&SnapshotWriter> {
        self.writer.as_ref()
    }

    pub fn persistence(&self) -> Option<&Arc<SnapshotPersistence>> {
        self.writer.as_ref().map(SnapshotWriter::persistence)
    }

    fn persist(&self, record: &SessionRecord) {
        if let Some(writer) = &self.writer {
            writer.submit(record.snapshot());
        }
    }

    /// Wait for queued durable writes to land.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// Create a `pending` session for the pair.
    ///
    /// Fails with `DuplicateActiveSession` naming the existing id if the pair
    /// already has an active session. The check and the insert happen under
    /// one write lock.
    pub fn create_session(
        &self,
        user_id: i64,
        conversation_id: i64,
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Result<Arc<SessionRecord>, SessionError> {
        self.create_session_with_params(
            user_id,
            conversation_id,
            model,
            messages,
            GenerationParams::default(),
        )
    }

    pub fn create_session_with_params(
        &self,
        user_id: i64,
        conversation_id: i64,
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<Arc<SessionRecord>, SessionError> {
        let record = {
            let mut inner = self.write();
            if let Some(existing) = inner.active_for(user_id, conversation_id) {
                return Err(SessionError::DuplicateActiveSession {
                    existing: existing.id(),
                });
            }
            let record = Arc::new(
                SessionRecord::new(user_id, conversation_id, model.into(), messages, &self.config)
                    .with_params(params),
            );
            inner.insert(record.clone());
            record
        };

        self.persist(&record);
        tracing::info!(
            session_id = %record.id(),
            user_id,
            conversation_id,
            model = record.model(),
            "session created"
        );
        Ok(record)
    }

    fn peek(&self, id: Uuid) -> Option<Arc<SessionRecord>> {
        self.read().sessions.get(&id).cloned()
    }

    /// Look up a session and refresh its `last_activity`.
    pub fn get_session(&self, id: Uuid) -> Option<Arc<SessionRecord>> {
        let record = self.peek(id)?;
        record.touch();
        Some(record)
    }

    /// The active session for the pair, if any. Terminal sessions are never
    /// returned here.
    pub fn get_conversation_session(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> Option<Arc<SessionRecord>> {
        let record = self.read().active_for(user_id, conversation_id).cloned()?;
        record.touch();
        Some(record)
    }

    /// Every in-memory session of the user, oldest first.
    pub fn list_user_sessions(&self, user_id: i64) -> Vec<Arc<SessionRecord>> {
        let mut sessions: Vec<Arc<SessionRecord>> = {
            let inner = self.read();
            inner
                .by_user
                .get(&user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.sessions.get(id).cloned())
                .collect()
        };
        sessions.sort_by_key(|record| (record.created_at(), record.id()));
        sessions
    }

    /// `pending -> processing`.
    pub fn mark_processing(&self, id: Uuid) -> bool {
        let Some(record) = self.peek(id) else {
            return false;
        };
        if !record.mark_processing() {
            return false;
        }
        self.persist(&record);
        true
    }

    /// Append an output fragment and offer it to the progress queue.
    ///
    /// A full queue drops the fragment for queue consumers only; it stays in
    /// the replay log. Unknown and terminal sessions are ignored.
    pub fn update_progress(&self, id: Uuid, fragment: &str) -> bool {
        let Some(record) = self.peek(id) else {
            return false;
        };
        let Some(sender) = record.append_progress(fragment) else {
            return false;
        };
        if let Some(tx) = sender {
            offer(&tx, fragment.to_string(), id, "progress");
        }
        self.persist(&record);
        true
    }

    /// Offer a raw model chunk to the chunk queue, dropping it when full.
    pub fn offer_chunk(&self, id: Uuid, chunk: Chunk) -> bool {
        let Some(record) = self.peek(id) else {
            return false;
        };
        match record.chunk_sender() {
            Some(tx) => offer(&tx, chunk, id, "chunk"),
            None => false,
        }
    }

    pub fn complete(&self, id: Uuid, result: String, quota: f32) -> bool {
        self.finish(id, Terminal::Completed { result, quota })
    }

    pub fn fail(&self, id: Uuid, message: impl Into<String>) -> bool {
        self.finish(
            id,
            Terminal::Failed {
                message: message.into(),
            },
        )
    }

    /// Move an active session to `cancelled` and fire its handle.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.finish(id, Terminal::Cancelled)
    }

    /// The single terminal-transition path.
    ///
    /// The status change and the conversation-index update happen under the
    /// registry write lock, so a new session for the same conversation can
    /// be created as soon as this returns. Returns false if the session is
    /// unknown or already terminal.
    fn finish(&self, id: Uuid, outcome: Terminal) -> bool {
        let record = {
            let mut inner = self.write();
            let Some(record) = inner.sessions.get(&id).cloned() else {
                return false;
            };
            if !record.finish(&outcome) {
                return false;
            }
            let key = (record.user_id(), record.conversation_id());
            if inner.active_by_conversation.get(&key) == Some(&id) {
                inner.active_by_conversation.remove(&key);
            }
            record
        };

        record.close_queues();
        record.cancel_handle().cancel();
        self.persist(&record);

        match &outcome {
            Terminal::Completed { quota, .. } => {
                tracing::info!(session_id = %id, quota, "session completed");
            }
            Terminal::Failed { message } => {
                tracing::warn!(session_id = %id, error = %message, "session failed");
            }
            Terminal::Cancelled => {
                tracing::info!(session_id = %id, "session cancelled");
            }
        }
        true
    }

    /// A pull cursor positioned at the start of the session's output.
    pub fn new_observer(&self, id: Uuid) -> Option<Observer> {
        self.get_session(id).map(Observer::new)
    }

    pub fn take_progress_receiver(&self, id: Uuid) -> Option<mpsc::Receiver<String>> {
        self.peek(id)?.take_progress_receiver()
    }

    pub fn take_chunk_receiver(&self, id: Uuid) -> Option<mpsc::Receiver<Chunk>> {
        self.peek(id)?.take_chunk_receiver()
    }

    /// Find a session in memory, or resurrect it from its durable snapshot.
    ///
    /// A resurrected snapshot that is active but stale is forced to `error`
    /// with the recovery-expired message. One that is active but whose
    /// conversation already has a different active session is forced to
    /// `error` as superseded.
    pub async fn reconnect(&self, id: Uuid) -> Result<Arc<SessionRecord>, SessionError> {
        if let Some(record) = self.get_session(id) {
            return Ok(record);
        }

        let persistence = self.persistence().ok_or(SessionError::SessionNotFound(id))?;
        let snapshot = persistence
            .load(id)
            .await?
            .ok_or(SessionError::SessionNotFound(id))?;

        let snapshot = self.expire_if_stale(snapshot, Utc::now());
        let (record, admission) = self.admit(SessionRecord::restore(snapshot, &self.config));
        if admission != Admission::AlreadyPresent {
            self.persist(&record);
            tracing::info!(session_id = %id, status = %record.status(), ?admission, "session reconnected from snapshot");
        }
        Ok(record)
    }

    /// Force a stale active snapshot to `error`. Anything else is returned
    /// unchanged.
    pub(crate) fn expire_if_stale(
        &self,
        mut snapshot: SessionSnapshot,
        now: DateTime<Utc>,
    ) -> SessionSnapshot {
        if snapshot.status.is_active()
            && now - snapshot.last_activity > self.config.stale_after_chrono()
        {
            snapshot.status = SessionStatus::Error;
            snapshot.error = Some(RECOVERY_EXPIRED_MESSAGE.to_string());
            snapshot.completed_at = Some(now);
        }
        snapshot
    }

    /// Insert a restored record, honoring the one-active-per-conversation
    /// rule.
    pub(crate) fn admit(&self, record: SessionRecord) -> (Arc<SessionRecord>, Admission) {
        let mut inner = self.write();
        if let Some(existing) = inner.sessions.get(&record.id()) {
            return (existing.clone(), Admission::AlreadyPresent);
        }

        let mut admission = Admission::Admitted;
        if record.status().is_active()
            && inner
                .active_for(record.user_id(), record.conversation_id())
                .is_some()
        {
            record.finish(&Terminal::Failed {
                message: SUPERSEDED_MESSAGE.to_string(),
            });
            record.close_queues();
            record.cancel_handle().cancel();
            admission = Admission::Superseded;
        }

        let record = Arc::new(record);
        inner.insert(record.clone());
        (record, admission)
    }

    /// Cancel stale active sessions and evict stale sessions from memory.
    ///
    /// Staleness is judged by `last_activity` against `now`. Cancellation
    /// goes through the normal terminal path, so cancelled sessions are
    /// persisted before they are evicted. Durable snapshots are left to
    /// expire on their own TTL.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let threshold = self.config.stale_after_chrono();
        let stale: Vec<(Uuid, bool)> = self
            .read()
            .sessions
            .values()
            .filter(|record| now - record.last_activity() > threshold)
            .map(|record| (record.id(), record.status().is_active()))
            .collect();

        let mut report = SweepReport::default();
        let mut cancelled = HashSet::new();
        for &(id, active) in &stale {
            if active && self.cancel(id) {
                report.cancelled += 1;
                cancelled.insert(id);
            }
        }

        let candidates: Vec<Uuid> = stale.into_iter().map(|(id, _)| id).collect();
        report.evicted = self.evict_stale(&candidates, &cancelled, now);
        report
    }

    /// Evict terminal candidates. A candidate touched since the scan is no
    /// longer stale and stays, unless this sweep cancelled it.
    fn evict_stale(
        &self,
        candidates: &[Uuid],
        cancelled: &HashSet<Uuid>,
        now: DateTime<Utc>,
    ) -> usize {
        let threshold = self.config.stale_after_chrono();
        let mut inner = self.write();
        let mut evicted = 0;
        for &id in candidates {
            let evictable = inner.sessions.get(&id).is_some_and(|record| {
                record.is_terminal()
                    && (cancelled.contains(&id) || now - record.last_activity() > threshold)
            });
            if evictable && inner.remove(id).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.read()
            .sessions
            .values()
            .filter(|record| record.status().is_active())
            .count()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

fn offer<T>(tx: &mpsc::Sender<T>, value: T, id: Uuid, queue: &'static str) -> bool {
    match tx.try_send(value) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::debug!(session_id = %id, queue, "delivery queue full, dropping item");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
