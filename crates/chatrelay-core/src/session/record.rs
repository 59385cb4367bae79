//! A single generation session: durable fields plus runtime-only state.
//!
//! Immutable fields live directly on [`SessionRecord`]. Mutable fields sit
//! behind a per-record lock that is always taken *after* the registry lock,
//! never before. The runtime-only fields (cancellation handle, the two
//! bounded delivery queues) are never serialized.

use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chatrelay_types::config::SessionConfig;
use chatrelay_types::llm::{ChatMessage, Chunk, GenerationParams};
use chatrelay_types::session::{SessionSnapshot, SessionStatus, SessionView};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::cancel::CancelHandle;

/// How a session ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Completed { result: String, quota: f32 },
    Failed { message: String },
    Cancelled,
}

impl Terminal {
    fn status(&self) -> SessionStatus {
        match self {
            Terminal::Completed { .. } => SessionStatus::Completed,
            Terminal::Failed { .. } => SessionStatus::Error,
            Terminal::Cancelled => SessionStatus::Cancelled,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    progress: String,
    total_progress: String,
    last_activity: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result: String,
    error: Option<String>,
    quota: f32,
}

#[derive(Debug)]
struct QueueSenders {
    progress: mpsc::Sender<String>,
    chunks: mpsc::Sender<Chunk>,
}

#[derive(Debug, Default)]
struct QueueReceivers {
    progress: Option<mpsc::Receiver<String>>,
    chunks: Option<mpsc::Receiver<Chunk>>,
}

/// Authoritative in-memory copy of one session.
#[derive(Debug)]
pub struct SessionRecord {
    id: Uuid,
    user_id: i64,
    conversation_id: i64,
    model: String,
    messages: Vec<ChatMessage>,
    params: GenerationParams,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    cancel: CancelHandle,
    /// `None` once the queues have been closed.
    senders: Mutex<Option<QueueSenders>>,
    receivers: Mutex<QueueReceivers>,
}

impl SessionRecord {
    /// Create a fresh `pending` session.
    pub fn new(
        user_id: i64,
        conversation_id: i64,
        model: String,
        messages: Vec<ChatMessage>,
        config: &SessionConfig,
    ) -> Self {
        let now = Utc::now();
        let (senders, receivers) = open_queues(config.queue_capacity);
        Self {
            id: Uuid::now_v7(),
            user_id,
            conversation_id,
            model,
            messages,
            params: GenerationParams::default(),
            created_at: now,
            state: RwLock::new(SessionState {
                status: SessionStatus::Pending,
                progress: String::new(),
                total_progress: String::new(),
                last_activity: now,
                completed_at: None,
                result: String::new(),
                error: None,
                quota: 0.0,
            }),
            cancel: CancelHandle::with_timeout(config.hard_timeout()),
            senders: Mutex::new(Some(senders)),
            receivers: Mutex::new(receivers),
        }
    }

    /// Attach sampling parameters. Only meaningful before the record is
    /// shared.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Rebuild a record from its durable snapshot.
    ///
    /// A non-terminal snapshot gets fresh runtime fields (new cancellation
    /// handle, new empty queues) because the task that owned the old ones is
    /// gone. A terminal snapshot gets queues that are already closed.
    pub fn restore(snapshot: SessionSnapshot, config: &SessionConfig) -> Self {
        let active = snapshot.status.is_active();
        let (senders, receivers, cancel) = if active {
            let (senders, receivers) = open_queues(config.queue_capacity);
            (
                Some(senders),
                receivers,
                CancelHandle::with_timeout(config.hard_timeout()),
            )
        } else {
            (None, QueueReceivers::default(), CancelHandle::cancelled_now())
        };

        Self {
            id: snapshot.id,
            user_id: snapshot.user_id,
            conversation_id: snapshot.conversation_id,
            model: snapshot.model,
            messages: snapshot.messages,
            params: snapshot.params,
            created_at: snapshot.created_at,
            state: RwLock::new(SessionState {
                status: snapshot.status,
                progress: snapshot.progress,
                total_progress: snapshot.total_progress,
                last_activity: snapshot.last_activity,
                completed_at: snapshot.completed_at,
                result: snapshot.result,
                error: snapshot.error,
                quota: snapshot.quota,
            }),
            cancel,
            senders: Mutex::new(senders),
            receivers: Mutex::new(receivers),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn params(&self) -> GenerationParams {
        self.params
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        self.read().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.read().last_activity
    }

    pub fn total_progress(&self) -> String {
        self.read().total_progress.clone()
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    /// Serializable projection, excluding runtime fields.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.read();
        SessionSnapshot {
            id: self.id,
            conversation_id: self.conversation_id,
            user_id: self.user_id,
            status: state.status,
            progress: state.progress.clone(),
            total_progress: state.total_progress.clone(),
            created_at: self.created_at,
            last_activity: state.last_activity,
            completed_at: state.completed_at,
            model: self.model.clone(),
            messages: self.messages.clone(),
            params: self.params,
            result: state.result.clone(),
            error: state.error.clone(),
            quota: state.quota,
        }
    }

    pub fn view(&self) -> SessionView {
        self.snapshot().view()
    }

    pub fn touch(&self) {
        self.write().last_activity = Utc::now();
    }

    /// Output appended since byte `offset`, plus the new end offset.
    ///
    /// Fragments are appended whole, so any offset previously returned by
    /// this method lies on a character boundary. Returns `None` for an
    /// offset that is past the end or splits a character.
    pub fn read_from(&self, offset: usize) -> Option<(String, usize)> {
        let state = self.read();
        let total = &state.total_progress;
        if offset > total.len() || !total.is_char_boundary(offset) {
            return None;
        }
        Some((total[offset..].to_string(), total.len()))
    }

    /// Length in bytes of the accumulated output.
    pub fn total_len(&self) -> usize {
        self.read().total_progress.len()
    }

    /// `pending -> processing`. Returns false in any other state.
    pub(crate) fn mark_processing(&self) -> bool {
        let mut state = self.write();
        if state.status != SessionStatus::Pending {
            return false;
        }
        state.status = SessionStatus::Processing;
        state.last_activity = Utc::now();
        true
    }

    /// Append a fragment to the replay log.
    ///
    /// Returns the progress queue sender to offer the fragment to, or `None`
    /// when the record is terminal and nothing was appended. The offer
    /// itself happens outside the state lock.
    pub(crate) fn append_progress(&self, fragment: &str) -> Option<Option<mpsc::Sender<String>>> {
        {
            let mut state = self.write();
            if state.status.is_terminal() {
                return None;
            }
            state.progress = fragment.to_string();
            state.total_progress.push_str(fragment);
            state.last_activity = Utc::now();
        }
        Some(self.progress_sender())
    }

    fn progress_sender(&self) -> Option<mpsc::Sender<String>> {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.progress.clone())
    }

    pub(crate) fn chunk_sender(&self) -> Option<mpsc::Sender<Chunk>> {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.chunks.clone())
    }

    /// Apply the terminal transition. Returns false if already terminal.
    pub(crate) fn finish(&self, outcome: &Terminal) -> bool {
        let mut state = self.write();
        if state.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        state.status = outcome.status();
        state.completed_at = Some(now);
        state.last_activity = now;
        match outcome {
            Terminal::Completed { result, quota } => {
                state.result = result.clone();
                state.quota = *quota;
            }
            Terminal::Failed { message } => {
                state.error = Some(message.clone());
            }
            Terminal::Cancelled => {}
        }
        true
    }

    /// Drop the queue senders, closing both queues. Returns true only for
    /// the call that actually closed them.
    pub(crate) fn close_queues(&self) -> bool {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn queues_closed(&self) -> bool {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Hand out the receiving end of the progress queue (once).
    pub fn take_progress_receiver(&self) -> Option<mpsc::Receiver<String>> {
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .progress
            .take()
    }

    /// Hand out the receiving end of the raw-chunk queue (once).
    pub fn take_chunk_receiver(&self) -> Option<mpsc::Receiver<Chunk>> {
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .chunks
            .take()
    }
}

fn open_queues(capacity: usize) -> (QueueSenders, QueueReceivers) {
    let capacity = capacity.max(1);
    let (progress_tx, progress_rx) = mpsc::channel(capacity);
    let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
    (
        QueueSenders {
            progress: progress_tx,
            chunks: chunk_tx,
        },
        QueueReceivers {
            progress: Some(progress_rx),
            chunks: Some(chunk_rx),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord::new(
            7,
            42,
            "m".to_string(),
            vec![ChatMessage::user("hi")],
            &SessionConfig::default(),
        )
    }

    #[test]
    fn test_new_record_is_pending_with_open_queues() {
        let record = record();
        assert_eq!(record.status(), SessionStatus::Pending);
        assert!(!record.queues_closed());
        assert!(!record.cancel_handle().is_cancelled());
        assert!(record.take_progress_receiver().is_some());
        assert!(record.take_progress_receiver().is_none());
    }

    #[test]
    fn test_append_accumulates() {
        let record = record();
        record.append_progress("Hel");
        record.append_progress("lo");
        let snapshot = record.snapshot();
        assert_eq!(snapshot.total_progress, "Hello");
        assert_eq!(snapshot.progress, "lo");
    }

    #[test]
    fn test_finish_is_at_most_once() {
        let record = record();
        assert!(record.finish(&Terminal::Completed {
            result: "ok".to_string(),
            quota: 1.5,
        }));
        let completed_at = record.snapshot().completed_at;
        assert!(completed_at.is_some());

        assert!(!record.finish(&Terminal::Failed {
            message: "late".to_string(),
        }));
        let snapshot = record.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.completed_at, completed_at);
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn test_append_after_terminal_is_ignored() {
        let record = record();
        record.append_progress("a");
        record.finish(&Terminal::Cancelled);
        assert!(record.append_progress("b").is_none());
        assert_eq!(record.total_progress(), "a");
    }

    #[test]
    fn test_close_queues_once() {
        let record = record();
        assert!(record.close_queues());
        assert!(!record.close_queues());
        assert!(record.queues_closed());
        assert!(record.chunk_sender().is_none());
    }

    #[test]
    fn test_read_from_rejects_bad_offsets() {
        let record = record();
        record.append_progress("héllo");
        assert_eq!(record.read_from(0).unwrap().0, "héllo");
        assert!(record.read_from(2).is_none());
        assert!(record.read_from(100).is_none());
        let (rest, end) = record.read_from(3).unwrap();
        assert_eq!(rest, "llo");
        assert_eq!(end, record.total_len());
    }

    #[test]
    fn test_restore_terminal_has_closed_queues() {
        let original = record();
        original.finish(&Terminal::Failed {
            message: "boom".to_string(),
        });
        let restored = SessionRecord::restore(original.snapshot(), &SessionConfig::default());
        assert!(restored.queues_closed());
        assert_eq!(restored.status(), SessionStatus::Error);
        assert_eq!(restored.id(), original.id());
    }

    #[test]
    fn test_restore_active_gets_fresh_runtime_fields() {
        let original = record();
        original.append_progress("partial");
        let restored = SessionRecord::restore(original.snapshot(), &SessionConfig::default());
        assert!(!restored.queues_closed());
        assert!(!restored.cancel_handle().is_cancelled());
        assert_eq!(restored.total_progress(), "partial");
    }
}
