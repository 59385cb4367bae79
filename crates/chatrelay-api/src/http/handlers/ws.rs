//! WebSocket handler for push-mode session progress.
//!
//! `GET /api/v1/ws/sessions/{id}` upgrades to a WebSocket and forwards the
//! session's push events (`status`, `progress`, `ping`, `completed`) as JSON
//! text frames. The socket closes after `completed`.
//!
//! Disconnecting does **not** cancel the session; a reconnecting client gets
//! a fresh replay from offset 0. Clients may send `{"type":"cancel"}` to
//! cancel explicitly, or `{"type":"ping"}` for a `{"type":"pong"}` reply.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use chatrelay_core::service::PushStream;

use crate::http::error::AppError;
use crate::http::extractors::auth::AuthUser;
use crate::http::handlers::session::parse_uuid;
use crate::state::AppState;

/// Incoming command from a WebSocket client. Unknown or malformed messages
/// are logged and ignored.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    Cancel,
    Ping,
}

/// Upgrade to a push-mode progress stream.
///
/// Ownership and existence are checked before the upgrade, so an unknown
/// session is a plain 404 rather than a socket that closes immediately.
pub async fn session_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    auth: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_uuid(&session_id)?;
    let events = state.session_service.subscribe(auth.user_id, id).await?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, events, state, auth, id)))
}

async fn handle_socket(
    socket: WebSocket,
    mut events: PushStream,
    state: AppState,
    auth: AuthUser,
    id: Uuid,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    tracing::debug!(session_id = %id, "session stream connected");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let is_final = event.is_final();
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(session_id = %id, "Failed to serialize push event: {err}");
                    }
                }
                if is_final {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        process_command(&text, &mut ws_sender, &state, auth, id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(session_id = %id, "WebSocket receive error: {err}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!(session_id = %id, "session stream closed");
}

async fn process_command(
    text: &str,
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    state: &AppState,
    auth: AuthUser,
    id: Uuid,
) {
    let cmd: WsCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(err) => {
            tracing::warn!(raw = %text, error = %err, "Ignoring malformed WebSocket command");
            return;
        }
    };

    match cmd {
        WsCommand::Cancel => match state.session_service.cancel(auth.user_id, id).await {
            // The push stream notices the terminal state and sends `completed`.
            Ok(_) => tracing::info!(session_id = %id, "session cancelled via WebSocket"),
            Err(err) => tracing::debug!(session_id = %id, error = %err, "cancel via WebSocket refused"),
        },
        WsCommand::Ping => {
            let pong = r#"{"type":"pong"}"#;
            if ws_sender.send(Message::Text(pong.into())).await.is_err() {
                tracing::debug!("Failed to send pong (client disconnecting)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        assert!(matches!(
            serde_json::from_str::<WsCommand>(r#"{"type":"cancel"}"#).unwrap(),
            WsCommand::Cancel
        ));
        assert!(matches!(
            serde_json::from_str::<WsCommand>(r#"{"type":"ping"}"#).unwrap(),
            WsCommand::Ping
        ));
        assert!(serde_json::from_str::<WsCommand>(r#"{"type":"resume"}"#).is_err());
    }
}
