//! Push-channel event payloads.
//!
//! Every event is a JSON object tagged by a `type` field:
//!
//! ```json
//! {"type":"status","status":{...}}
//! {"type":"progress","progress":"lo","status":"processing"}
//! {"type":"ping"}
//! {"type":"completed","status":{...},"progress":"Hello"}
//! ```

use serde::{Deserialize, Serialize};

use crate::session::{SessionStatus, SessionView};

/// Event delivered to a push-mode observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// Full status snapshot, sent once on connect.
    Status { status: SessionView },
    /// New output since the observer's last read.
    Progress {
        progress: String,
        status: SessionStatus,
    },
    /// Liveness heartbeat so idle connections are not reaped.
    Ping,
    /// Terminal event carrying the full accumulated output. Sent once,
    /// right before the stream ends.
    Completed {
        status: SessionView,
        progress: String,
    },
}

impl PushEvent {
    /// Whether this is the final event of a push stream.
    pub fn is_final(&self) -> bool {
        matches!(self, PushEvent::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_serializes_with_type_only() {
        let json = serde_json::to_string(&PushEvent::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_progress_event_shape() {
        let event = PushEvent::Progress {
            progress: "lo".to_string(),
            status: SessionStatus::Processing,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["progress"], "lo");
        assert_eq!(value["status"], "processing");
        assert!(!event.is_final());
    }
}
