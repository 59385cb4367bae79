//! The generation pipeline.
//!
//! Drives one session: `pending -> processing`, stream the model output into
//! the registry chunk by chunk, then settle billing, save the answer to the
//! conversation and make exactly one terminal call. Cancellation is observed
//! at every chunk boundary and also while waiting on a stalled upstream;
//! leaving the stream loop drops the stream, which aborts the request.

use std::sync::Arc;

use chatrelay_types::llm::{MessageRole, ModelError, ModelEvent, TokenUsage};
use chatrelay_types::error::RepositoryError;
use futures_util::StreamExt;

use super::buffer::OutputBuffer;
use super::collaborators::{
    Authorization, ConversationStore, GenerationRequest, ModelClient, QuotaLedger,
};
use crate::session::INTERNAL_ERROR_MESSAGE;
use crate::session::record::SessionRecord;
use crate::session::registry::SessionRegistry;

/// Final text stored when the model produced nothing visible.
pub const EMPTY_RESPONSE: &str = "Empty response";

/// User id of anonymous sessions, whose answers are never saved to a
/// conversation.
pub const ANONYMOUS_USER_ID: i64 = -1;

enum StreamOutcome {
    Finished {
        buffer: OutputBuffer,
        cache_hit: bool,
        usage: TokenUsage,
    },
    Cancelled,
    Failed(ModelError),
}

pub struct GenerationPipeline<M, Q, C> {
    registry: Arc<SessionRegistry>,
    model: Arc<M>,
    ledger: Arc<Q>,
    conversations: Arc<C>,
}

impl<M, Q, C> GenerationPipeline<M, Q, C>
where
    M: ModelClient + 'static,
    Q: QuotaLedger + 'static,
    C: ConversationStore + 'static,
{
    pub fn new(
        registry: Arc<SessionRegistry>,
        model: Arc<M>,
        ledger: Arc<Q>,
        conversations: Arc<C>,
    ) -> Self {
        Self {
            registry,
            model,
            ledger,
            conversations,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<Q> {
        &self.ledger
    }

    pub fn conversations(&self) -> &Arc<C> {
        &self.conversations
    }

    /// Run the session to a terminal state. Does nothing if the session is
    /// no longer `pending`.
    pub async fn run(&self, record: Arc<SessionRecord>, authorization: Authorization) {
        let id = record.id();
        if !self.registry.mark_processing(id) {
            tracing::debug!(session_id = %id, "session not pending, pipeline skipped");
            return;
        }

        let label = &self.registry.config().initial_progress_label;
        if !label.is_empty() {
            self.registry.update_progress(id, label);
        }

        tracing::debug!(session_id = %id, model = record.model(), "streaming from upstream");
        match self.stream(&record).await {
            StreamOutcome::Finished {
                buffer,
                cache_hit,
                usage,
            } => {
                self.settle(&record, authorization, buffer, cache_hit, usage)
                    .await;
            }
            StreamOutcome::Cancelled => {
                self.registry.cancel(id);
            }
            StreamOutcome::Failed(e) if e.is_availability() => {
                if authorization.covered_by_plan {
                    if let Err(revert_err) =
                        self.ledger.revert(record.user_id(), record.model()).await
                    {
                        tracing::warn!(session_id = %id, error = %revert_err, "failed to revert subscription charge");
                    }
                }
                self.registry.fail(id, e.to_string());
            }
            StreamOutcome::Failed(e) => {
                tracing::warn!(session_id = %id, error = %e, "upstream request failed");
                self.registry.fail(id, INTERNAL_ERROR_MESSAGE);
            }
        }
    }

    async fn stream(&self, record: &SessionRecord) -> StreamOutcome {
        let id = record.id();
        let cancel = record.cancel_handle();
        let mut stream = self.model.stream_chat(GenerationRequest {
            model: record.model().to_string(),
            messages: record.messages().to_vec(),
            params: record.params(),
        });
        let mut buffer = OutputBuffer::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(ModelEvent::Chunk(chunk))) => {
                    if cancel.is_cancelled() {
                        return StreamOutcome::Cancelled;
                    }
                    let delta = buffer.write_chunk(&chunk);
                    if !delta.is_empty() {
                        self.registry.update_progress(id, &delta);
                    }
                    self.registry.offer_chunk(id, chunk);
                }
                Some(Ok(ModelEvent::Finished { cache_hit, usage })) => {
                    return StreamOutcome::Finished {
                        buffer,
                        cache_hit,
                        usage,
                    };
                }
                Some(Err(ModelError::Aborted)) if cancel.is_cancelled() => {
                    return StreamOutcome::Cancelled;
                }
                Some(Err(e)) => return StreamOutcome::Failed(e),
                // A stream that ends without a finish event reported no usage.
                None => {
                    return StreamOutcome::Finished {
                        buffer,
                        cache_hit: false,
                        usage: TokenUsage::default(),
                    };
                }
            }
        }
    }

    async fn settle(
        &self,
        record: &SessionRecord,
        authorization: Authorization,
        buffer: OutputBuffer,
        cache_hit: bool,
        usage: TokenUsage,
    ) {
        let id = record.id();
        if record.cancel_handle().is_cancelled() {
            self.registry.cancel(id);
            return;
        }

        let quota = if cache_hit || authorization.covered_by_plan {
            0.0
        } else {
            match self
                .ledger
                .collect(record.user_id(), record.model(), usage)
                .await
            {
                Ok(quota) => quota,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "quota collection failed");
                    0.0
                }
            }
        };

        let result = buffer.read_with_default(EMPTY_RESPONSE);
        self.save_answer(record, &result).await;
        self.registry.complete(id, result, quota);
    }

    /// Append the answer to the conversation unless it is already the newest
    /// assistant message there.
    async fn save_answer(&self, record: &SessionRecord, result: &str) {
        let (user_id, conversation_id) = (record.user_id(), record.conversation_id());
        if user_id == ANONYMOUS_USER_ID {
            return;
        }

        match self
            .conversations
            .latest_message(user_id, conversation_id)
            .await
        {
            Ok(Some(latest)) if latest.role == MessageRole::Assistant && latest.content == result => {
                tracing::debug!(session_id = %record.id(), "answer already saved");
            }
            Ok(_) => {
                if let Err(e) = self
                    .conversations
                    .append_assistant_message(user_id, conversation_id, result)
                    .await
                {
                    tracing::warn!(session_id = %record.id(), error = %e, "failed to save answer");
                }
            }
            Err(RepositoryError::NotFound) => {
                tracing::debug!(session_id = %record.id(), conversation_id, "conversation not found, answer not saved");
            }
            Err(e) => {
                tracing::warn!(session_id = %record.id(), error = %e, "failed to load conversation");
            }
        }
    }
}

impl<M, Q, C> std::fmt::Debug for GenerationPipeline<M, Q, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationPipeline").finish_non_exhaustive()
    }
}
