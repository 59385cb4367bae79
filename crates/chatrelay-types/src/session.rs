//! Generation session status, durable snapshot, and status view types.
//!
//! A generation session is one long-running model request tied to a
//! (user, conversation) pair. [`SessionSnapshot`] is the serializable
//! projection written to the durable cache; it never carries runtime-only
//! state (cancellation handle, delivery queues).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::llm::{ChatMessage, GenerationParams};

/// Lifecycle status of a generation session.
///
/// `Completed`, `Error` and `Cancelled` are terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl SessionStatus {
    /// Whether the session is still pending or processing.
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Processing)
    }

    /// Whether the session has reached an absorbing state.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Processing => write!(f, "processing"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "processing" => Ok(SessionStatus::Processing),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("invalid session status: '{other}'")),
        }
    }
}

/// Durable projection of a session record.
///
/// Stored as JSON under `"<namespace>:<session-id>"` with a retention TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub conversation_id: i64,
    pub user_id: i64,
    pub status: SessionStatus,
    pub progress: String,
    pub total_progress: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub quota: f32,
}

impl SessionSnapshot {
    /// Build the client-facing status view.
    ///
    /// `result` is only exposed for completed sessions and `error` only for
    /// failed ones, so clients branch on `status` alone.
    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id,
            conversation_id: self.conversation_id,
            status: self.status,
            model: self.model.clone(),
            progress: self.progress.clone(),
            total_progress: self.total_progress.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            completed_at: self.completed_at,
            result: (self.status == SessionStatus::Completed).then(|| self.result.clone()),
            error: if self.status == SessionStatus::Error {
                self.error.clone()
            } else {
                None
            },
            quota: self.quota,
        }
    }
}

/// Status view returned by the HTTP surface and carried in push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub conversation_id: i64,
    pub status: SessionStatus,
    pub model: String,
    pub progress: String,
    pub total_progress: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub quota: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: SessionStatus) -> SessionSnapshot {
        let now = Utc::now();
        SessionSnapshot {
            id: Uuid::now_v7(),
            conversation_id: 42,
            user_id: 7,
            status,
            progress: "lo".to_string(),
            total_progress: "Hello".to_string(),
            created_at: now,
            last_activity: now,
            completed_at: None,
            model: "m".to_string(),
            messages: vec![ChatMessage::user("hi")],
            params: GenerationParams::default(),
            result: "Hello".to_string(),
            error: Some("boom".to_string()),
            quota: 0.5,
        }
    }

    #[test]
    fn test_status_activity() {
        assert!(SessionStatus::Pending.is_active());
        assert!(SessionStatus::Processing.is_active());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("PROCESSING".parse::<SessionStatus>().unwrap(), SessionStatus::Processing);
        assert!("done".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_snapshot_field_names() {
        let json = serde_json::to_value(snapshot(SessionStatus::Processing)).unwrap();
        for field in [
            "id",
            "conversation_id",
            "user_id",
            "status",
            "progress",
            "total_progress",
            "created_at",
            "last_activity",
            "model",
            "messages",
            "result",
            "error",
            "quota",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        assert!(json.get("completed_at").is_none());
        assert_eq!(json["status"], "processing");
    }

    #[test]
    fn test_snapshot_without_params_decodes() {
        let mut json = serde_json::to_value(snapshot(SessionStatus::Pending)).unwrap();
        json.as_object_mut().unwrap().remove("params");

        let decoded: SessionSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.params, GenerationParams::default());
    }

    #[test]
    fn test_view_exposes_result_only_when_completed() {
        let view = snapshot(SessionStatus::Completed).view();
        assert_eq!(view.result.as_deref(), Some("Hello"));
        assert!(view.error.is_none());

        let view = snapshot(SessionStatus::Error).view();
        assert!(view.result.is_none());
        assert_eq!(view.error.as_deref(), Some("boom"));

        let view = snapshot(SessionStatus::Processing).view();
        assert!(view.result.is_none());
        assert!(view.error.is_none());
    }
}
