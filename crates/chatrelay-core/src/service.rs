//! Session service: the caller-facing entry point.
//!
//! Wraps the registry and the pipeline with the checks a caller needs:
//! authorization before anything is created, the restart policy for a
//! conversation that already has an active session, ownership checks on
//! every lookup, and panic isolation for the dispatched pipeline task.

use std::pin::Pin;
use std::sync::Arc;

use chatrelay_types::error::SessionError;
use chatrelay_types::event::PushEvent;
use chatrelay_types::llm::{ChatMessage, GenerationParams, MessageRole};
use chatrelay_types::session::{SessionStatus, SessionView};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delivery::observer::Observer;
use crate::delivery::push::push_events;
use crate::pipeline::collaborators::{
    Authorization, ConversationStore, ModelClient, QuotaLedger,
};
use crate::pipeline::processor::{ANONYMOUS_USER_ID, GenerationPipeline};
use crate::session::INTERNAL_ERROR_MESSAGE;
use crate::session::record::SessionRecord;
use crate::session::registry::SessionRegistry;

/// Boxed push-mode event stream.
pub type PushStream = Pin<Box<dyn Stream<Item = PushEvent> + Send + 'static>>;

/// Parameters of a new generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub conversation_id: i64,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Cancel the conversation's active session instead of failing with
    /// `DuplicateActiveSession`.
    #[serde(default)]
    pub restart: bool,
    /// Sampling parameters, given inline next to `model`.
    #[serde(flatten, default)]
    pub params: GenerationParams,
}

/// What a reconnecting client needs to resume rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectInfo {
    pub session_id: Uuid,
    pub session_status: SessionView,
    pub total_progress: String,
    pub is_completed: bool,
}

/// One pull-mode poll result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPage {
    /// Output appended since the requested offset.
    pub progress: String,
    /// Offset to pass on the next poll.
    pub offset: usize,
    pub status: SessionStatus,
    /// True once the session is terminal and `progress` holds everything
    /// that remained.
    pub is_completed: bool,
}

pub struct SessionService<M, Q, C> {
    registry: Arc<SessionRegistry>,
    pipeline: Arc<GenerationPipeline<M, Q, C>>,
}

impl<M, Q, C> Clone for SessionService<M, Q, C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<M, Q, C> SessionService<M, Q, C>
where
    M: ModelClient + 'static,
    Q: QuotaLedger + 'static,
    C: ConversationStore + 'static,
{
    pub fn new(pipeline: GenerationPipeline<M, Q, C>) -> Self {
        Self {
            registry: pipeline.registry().clone(),
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Authorize, apply the restart policy, create the session and dispatch
    /// its pipeline. Returns once the session exists; generation continues
    /// in the background.
    ///
    /// A trailing user message is stored in the conversation before the
    /// pipeline starts, so the prompt always precedes the saved answer.
    pub async fn start(
        &self,
        user_id: i64,
        request: StartRequest,
    ) -> Result<SessionView, SessionError> {
        let StartRequest {
            conversation_id,
            model,
            messages,
            restart,
            params,
        } = request;

        let authorization = self
            .pipeline
            .ledger()
            .authorize(user_id, &model, &messages)
            .await?;

        if let Some(existing) = self.registry.get_conversation_session(user_id, conversation_id) {
            if !restart {
                self.revert_provisional(user_id, &model, authorization).await;
                return Err(SessionError::DuplicateActiveSession {
                    existing: existing.id(),
                });
            }
            tracing::info!(session_id = %existing.id(), conversation_id, "restart requested, cancelling active session");
            self.registry.cancel(existing.id());
        }

        let prompt = messages
            .last()
            .filter(|m| m.role == MessageRole::User)
            .cloned();

        let record = match self.registry.create_session_with_params(
            user_id,
            conversation_id,
            model.clone(),
            messages,
            params,
        ) {
            Ok(record) => record,
            Err(e) => {
                self.revert_provisional(user_id, &model, authorization).await;
                return Err(e);
            }
        };

        if let Some(prompt) = prompt.filter(|_| user_id != ANONYMOUS_USER_ID) {
            if let Err(e) = self
                .pipeline
                .conversations()
                .record_prompt(user_id, conversation_id, &prompt)
                .await
            {
                tracing::warn!(session_id = %record.id(), error = %e, "failed to save prompt");
            }
        }

        let view = record.view();
        self.dispatch(record, authorization);
        Ok(view)
    }

    async fn revert_provisional(&self, user_id: i64, model: &str, authorization: Authorization) {
        if !authorization.covered_by_plan {
            return;
        }
        if let Err(e) = self.pipeline.ledger().revert(user_id, model).await {
            tracing::warn!(user_id, model, error = %e, "failed to revert subscription charge");
        }
    }

    /// Spawn the pipeline plus a supervisor that turns a panic or abort into
    /// a failed session.
    fn dispatch(&self, record: Arc<SessionRecord>, authorization: Authorization) {
        let id = record.id();
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(async move { pipeline.run(record, authorization).await });

        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(session_id = %id, "pipeline task panicked");
                } else {
                    tracing::error!(session_id = %id, error = %e, "pipeline task aborted");
                }
                registry.fail(id, INTERNAL_ERROR_MESSAGE);
            }
        });
    }

    /// Find a session the caller owns, resurrecting it from its durable
    /// snapshot if it is no longer in memory.
    async fn lookup(&self, user_id: i64, id: Uuid) -> Result<Arc<SessionRecord>, SessionError> {
        let record = self.registry.reconnect(id).await?;
        if record.user_id() != user_id {
            return Err(SessionError::PermissionDenied(format!(
                "session {id} belongs to another user"
            )));
        }
        Ok(record)
    }

    pub async fn status(&self, user_id: i64, id: Uuid) -> Result<SessionView, SessionError> {
        Ok(self.lookup(user_id, id).await?.view())
    }

    pub async fn cancel(&self, user_id: i64, id: Uuid) -> Result<SessionView, SessionError> {
        let record = self.lookup(user_id, id).await?;
        if !self.registry.cancel(id) {
            return Err(SessionError::NotCancellable {
                status: record.status(),
            });
        }
        Ok(record.view())
    }

    /// The caller's in-memory sessions, oldest first.
    pub fn list(&self, user_id: i64) -> Vec<SessionView> {
        self.registry
            .list_user_sessions(user_id)
            .iter()
            .map(|record| record.view())
            .collect()
    }

    /// The active session of one of the caller's conversations.
    pub fn conversation_session(&self, user_id: i64, conversation_id: i64) -> Option<SessionView> {
        self.registry
            .get_conversation_session(user_id, conversation_id)
            .map(|record| record.view())
    }

    pub async fn reconnect(&self, user_id: i64, id: Uuid) -> Result<ReconnectInfo, SessionError> {
        let record = self.lookup(user_id, id).await?;
        let view = record.view();
        Ok(ReconnectInfo {
            session_id: id,
            is_completed: view.status.is_terminal(),
            total_progress: view.total_progress.clone(),
            session_status: view,
        })
    }

    /// A pull cursor at offset 0.
    pub async fn observe(&self, user_id: i64, id: Uuid) -> Result<Observer, SessionError> {
        Ok(Observer::new(self.lookup(user_id, id).await?))
    }

    /// Push-mode event stream for one session.
    pub async fn subscribe(
        &self,
        user_id: i64,
        id: Uuid,
    ) -> Result<PushStream, SessionError> {
        let observer = self.observe(user_id, id).await?;
        let config = self.registry.config();
        Ok(Box::pin(push_events(
            observer,
            config.progress_tick(),
            config.ping_interval(),
        )))
    }

    /// Stateless poll: everything appended since `offset`.
    pub async fn poll(
        &self,
        user_id: i64,
        id: Uuid,
        offset: usize,
    ) -> Result<ProgressPage, SessionError> {
        let record = self.lookup(user_id, id).await?;
        // Status first: once terminal, nothing more is appended, so the pull
        // below is guaranteed to hold the rest of the output.
        let status = record.status();
        let mut observer = Observer::at_offset(record, offset)?;
        let progress = observer.pull();
        Ok(ProgressPage {
            progress,
            offset: observer.offset(),
            status,
            is_completed: status.is_terminal(),
        })
    }
}

impl<M, Q, C> std::fmt::Debug for SessionService<M, Q, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
