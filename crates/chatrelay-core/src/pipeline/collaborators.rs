//! Collaborator traits consumed by the pipeline.
//!
//! Uses RPITIT for the request/response calls and `Pin<Box<dyn Stream>>` for
//! the model stream, which has to outlive the call that created it.
//! Implementations live in chatrelay-infra.

use std::pin::Pin;

use chatrelay_types::error::{RepositoryError, SessionError};
use chatrelay_types::llm::{ChatMessage, GenerationParams, ModelError, ModelEvent, TokenUsage};
use futures_util::Stream;

/// Boxed model event stream.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ModelError>> + Send + 'static>>;

/// One upstream generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
}

/// Streaming access to an upstream model.
///
/// The stream yields zero or more `Chunk` events, then one `Finished` event.
/// Dropping the stream aborts the upstream request.
pub trait ModelClient: Send + Sync {
    fn stream_chat(&self, request: GenerationRequest) -> ModelStream;
}

/// Result of the creation-time authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Authorization {
    /// The request is covered by a subscription plan; nothing is collected
    /// at completion, and an upstream availability failure reverts the
    /// provisional plan charge.
    pub covered_by_plan: bool,
}

/// Billing and permission checks.
pub trait QuotaLedger: Send + Sync {
    /// Check the user may use `model`. Returns `PermissionDenied` otherwise.
    /// A plan-covered request is provisionally charged here.
    fn authorize(
        &self,
        user_id: i64,
        model: &str,
        messages: &[ChatMessage],
    ) -> impl std::future::Future<Output = Result<Authorization, SessionError>> + Send;

    /// Charge the user for a finished generation. Returns the charged quota.
    fn collect(
        &self,
        user_id: i64,
        model: &str,
        usage: TokenUsage,
    ) -> impl std::future::Future<Output = Result<f32, RepositoryError>> + Send;

    /// Undo the provisional plan charge made by `authorize`.
    fn revert(
        &self,
        user_id: i64,
        model: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

/// Persisted conversation history.
pub trait ConversationStore: Send + Sync {
    /// The newest stored message. `Err(NotFound)` if the conversation does
    /// not exist.
    fn latest_message(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<ChatMessage>, RepositoryError>> + Send;

    /// Store the user's prompt, creating the conversation if needed.
    fn record_prompt(
        &self,
        user_id: i64,
        conversation_id: i64,
        message: &ChatMessage,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn append_assistant_message(
        &self,
        user_id: i64,
        conversation_id: i64,
        content: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
