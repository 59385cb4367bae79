//! Chat message and upstream streaming types.
//!
//! These are the provider-agnostic shapes exchanged with the model-request
//! collaborator: the message list sent upstream, the chunks streamed back,
//! and the token usage reported at the end of a request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;

/// Role of a message within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// A single message in the request sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// One raw chunk received from the upstream model stream.
///
/// `content` is the visible text delta. `reasoning` carries the optional
/// thinking/reasoning delta some providers stream alongside the answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Chunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning: None,
        }
    }
}

/// Token usage reported by the upstream at the end of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Optional sampling parameters forwarded to the upstream. Unset fields are
/// left to the provider's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    /// Enable or disable the model's thinking phase, where supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think: Option<bool>,
}

/// Event yielded by a model stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// An incremental chunk of output.
    Chunk(Chunk),
    /// The request finished. `cache_hit` is true when the answer was served
    /// from a response cache and must not be billed.
    Finished { cache_hit: bool, usage: TokenUsage },
}

/// Errors from the model-request collaborator.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The provider was unreachable or refused the request. Reverts the
    /// provisional charge of a plan-covered request.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The provider rejected the request as malformed.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The stream was abandoned because the session was cancelled.
    #[error("request aborted")]
    Aborted,

    #[error("stream error: {0}")]
    Other(String),
}

impl ModelError {
    /// Whether this error means the provider itself is unavailable.
    pub fn is_availability(&self) -> bool {
        matches!(self, ModelError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_role_roundtrip() {
        for role in [
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
        ] {
            let parsed: MessageRole = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("robot".parse::<MessageRole>().is_err());
    }

    #[test]
    fn test_chat_message_serializes_lowercase_role() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }

    #[test]
    fn test_chunk_omits_missing_reasoning() {
        let json = serde_json::to_string(&Chunk::text("a")).unwrap();
        assert!(!json.contains("reasoning"));
    }

    #[test]
    fn test_token_usage_total_saturates() {
        let usage = TokenUsage {
            input_tokens: u32::MAX,
            output_tokens: 5,
        };
        assert_eq!(usage.total(), u32::MAX);
    }

    #[test]
    fn test_generation_params_omit_unset_fields() {
        let params = GenerationParams {
            temperature: Some(0.5),
            think: Some(false),
            ..GenerationParams::default()
        };
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json, serde_json::json!({"temperature": 0.5, "think": false}));

        let parsed: GenerationParams = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, GenerationParams::default());
    }

    #[test]
    fn test_model_error_availability() {
        assert!(ModelError::Unavailable("503".into()).is_availability());
        assert!(!ModelError::Rejected("bad".into()).is_availability());
        assert!(!ModelError::Aborted.is_availability());
    }

    #[test]
    fn test_usage_total() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 32,
        };
        assert_eq!(usage.total(), 42);
    }
}
