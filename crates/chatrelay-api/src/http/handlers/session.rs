//! Generation session HTTP handlers.
//!
//! Endpoints:
//! - POST /api/v1/sessions                      - Start a generation
//! - GET  /api/v1/sessions                      - List the caller's sessions
//! - GET  /api/v1/sessions/{id}                 - Session status
//! - POST /api/v1/sessions/{id}/cancel          - Cancel a session
//! - GET  /api/v1/sessions/{id}/reconnect       - Status plus full replay log
//! - GET  /api/v1/sessions/{id}/progress        - Pull-mode poll (`?offset=N`)
//! - GET  /api/v1/conversations/{id}/session    - Active session of a conversation

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chatrelay_core::service::{ProgressPage, ReconnectInfo, StartRequest};
use chatrelay_types::session::SessionView;

use crate::http::error::AppError;
use crate::http::extractors::auth::AuthUser;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    #[serde(default)]
    pub offset: usize,
}

/// Parse a UUID from a path parameter, returning a 400 error on invalid format.
pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, AppError> {
    s.parse::<Uuid>()
        .map_err(|_| AppError::Validation(format!("Invalid UUID: {s}")))
}

fn session_links<T: Serialize>(resp: ApiResponse<T>, id: Uuid) -> ApiResponse<T> {
    resp.with_link("self", &format!("/api/v1/sessions/{id}"))
        .with_link("progress", &format!("/api/v1/sessions/{id}/progress"))
        .with_link("stream", &format!("/api/v1/ws/sessions/{id}"))
}

/// POST /api/v1/sessions - Start a generation for a conversation.
pub async fn start_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<StartRequest>,
) -> Result<Json<ApiResponse<SessionView>>, AppError> {
    let start = Instant::now();

    if request.model.trim().is_empty() {
        return Err(AppError::Validation("model must not be empty".to_string()));
    }
    if request.messages.is_empty() {
        return Err(AppError::Validation("messages must not be empty".to_string()));
    }

    state
        .conversations
        .ensure_conversation(auth.user_id, request.conversation_id)
        .await?;

    // The service stores the prompt before dispatch; the pipeline appends
    // the answer once the stream completes.
    let view = state.session_service.start(auth.user_id, request).await?;
    tracing::info!(session_id = %view.session_id, user_id = auth.user_id, "session started");

    let id = view.session_id;
    Ok(Json(session_links(ApiResponse::success(view, start), id)))
}

/// GET /api/v1/sessions - The caller's in-memory sessions, oldest first.
pub async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ApiResponse<Vec<SessionView>>>, AppError> {
    let start = Instant::now();
    let sessions = state.session_service.list(auth.user_id);
    Ok(Json(
        ApiResponse::success(sessions, start).with_link("self", "/api/v1/sessions"),
    ))
}

/// GET /api/v1/sessions/{id} - Session status.
pub async fn get_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<SessionView>>, AppError> {
    let start = Instant::now();
    let id = parse_uuid(&session_id)?;
    let view = state.session_service.status(auth.user_id, id).await?;
    Ok(Json(session_links(ApiResponse::success(view, start), id)))
}

/// POST /api/v1/sessions/{id}/cancel - Cancel a pending or processing session.
pub async fn cancel_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<SessionView>>, AppError> {
    let start = Instant::now();
    let id = parse_uuid(&session_id)?;
    let view = state.session_service.cancel(auth.user_id, id).await?;
    tracing::info!(session_id = %id, user_id = auth.user_id, "session cancelled by client");
    Ok(Json(ApiResponse::success(view, start)))
}

/// GET /api/v1/sessions/{id}/reconnect - Status plus the full replay log.
pub async fn reconnect_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<ReconnectInfo>>, AppError> {
    let start = Instant::now();
    let id = parse_uuid(&session_id)?;
    let info = state.session_service.reconnect(auth.user_id, id).await?;
    Ok(Json(session_links(ApiResponse::success(info, start), id)))
}

/// GET /api/v1/sessions/{id}/progress?offset=N - Output appended since `offset`.
pub async fn poll_progress(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(session_id): Path<String>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<ApiResponse<ProgressPage>>, AppError> {
    let start = Instant::now();
    let id = parse_uuid(&session_id)?;
    let page = state
        .session_service
        .poll(auth.user_id, id, query.offset)
        .await?;
    let next = format!("/api/v1/sessions/{id}/progress?offset={}", page.offset);
    Ok(Json(ApiResponse::success(page, start).with_link("next", &next)))
}

/// GET /api/v1/conversations/{id}/session - The conversation's active session.
pub async fn get_conversation_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<ApiResponse<SessionView>>, AppError> {
    let start = Instant::now();
    let view = state
        .session_service
        .conversation_session(auth.user_id, conversation_id)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no active session found for conversation {conversation_id}"
            ))
        })?;
    let id = view.session_id;
    Ok(Json(session_links(ApiResponse::success(view, start), id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let id = Uuid::now_v7();
        assert_eq!(parse_uuid(&id.to_string()).unwrap(), id);
        assert!(matches!(parse_uuid("nope"), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_progress_query_defaults_to_zero() {
        let query: ProgressQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.offset, 0);
    }
}
