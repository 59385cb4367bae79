use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionStatus;

/// Errors surfaced by the session manager to its callers.
///
/// Errors raised inside a running pipeline never cross the task boundary;
/// they are captured into the session's `error` field instead.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A pending or processing session already exists for the conversation.
    /// Callers should attach to `existing` instead of starting a new one.
    #[error("conversation already has an active session: {existing}")]
    DuplicateActiveSession { existing: Uuid },

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("upstream unavailable: {0}")]
    UpstreamAvailability(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A durable snapshot was too stale to trust during recovery.
    #[error("session {0} expired during recovery")]
    RecoveryExpired(Uuid),

    /// The durable cache could not be reached. Never fails a foreground
    /// operation; only reported by direct cache calls.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("session cannot be cancelled (status: {status})")]
    NotCancellable { status: SessionStatus },

    #[error("invalid progress offset {offset} (length {len})")]
    InvalidOffset { offset: usize, len: usize },
}

/// Errors from repository and store operations (used by the collaborator
/// traits in chatrelay-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<RepositoryError> for SessionError {
    fn from(e: RepositoryError) -> Self {
        SessionError::CacheUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_error_names_existing_session() {
        let existing = Uuid::now_v7();
        let err = SessionError::DuplicateActiveSession { existing };
        assert!(err.to_string().contains(&existing.to_string()));
    }

    #[test]
    fn test_not_cancellable_display() {
        let err = SessionError::NotCancellable {
            status: SessionStatus::Completed,
        };
        assert_eq!(err.to_string(), "session cannot be cancelled (status: completed)");
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_repository_error_maps_to_cache_unavailable() {
        let err: SessionError = RepositoryError::Connection.into();
        assert!(matches!(err, SessionError::CacheUnavailable(_)));
    }
}
