//! Axum router configuration with middleware.
//!
//! All session routes are under `/api/v1/`; `/health` is unauthenticated.
//! Middleware: CORS, request tracing.

use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/sessions",
            post(handlers::session::start_session).get(handlers::session::list_sessions),
        )
        .route("/sessions/{id}", get(handlers::session::get_session))
        .route(
            "/sessions/{id}/cancel",
            post(handlers::session::cancel_session),
        )
        .route(
            "/sessions/{id}/reconnect",
            get(handlers::session::reconnect_session),
        )
        .route(
            "/sessions/{id}/progress",
            get(handlers::session::poll_progress),
        )
        .route(
            "/conversations/{id}/session",
            get(handlers::session::get_conversation_session),
        )
        .route("/ws/sessions/{id}", get(handlers::ws::session_stream));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Health check with registry counters (no auth required).
async fn health_check(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    let registry = state.session_service.registry();
    let writer = registry.writer().map(|writer| writer.stats());
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": {
            "total": registry.len(),
            "active": registry.active_count(),
        },
        "snapshots": writer.map(|stats| serde_json::json!({
            "written": stats.written,
            "failed": stats.failed,
            "coalesced": stats.coalesced,
        })),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;

    /// Serve the router on an ephemeral port. The upstream points at a
    /// closed port so every generation fails as unavailable.
    async fn spawn_server() -> (String, AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[upstream]\nbase_url = \"http://127.0.0.1:1/v1\"\nconnect_timeout_secs = 2\n",
        )
        .unwrap();
        let state = AppState::init_in(dir.path().to_path_buf()).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (format!("http://{addr}"), state, dir)
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (base, _state, _dir) = spawn_server().await;

        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"]["total"], 0);
    }

    #[tokio::test]
    async fn test_sessions_require_api_key() {
        let (base, _state, _dir) = spawn_server().await;

        let resp = reqwest::get(format!("{base}/api/v1/sessions")).await.unwrap();
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["errors"][0]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_unavailable_upstream_fails_session() {
        let (base, state, _dir) = spawn_server().await;
        let key = state.api_keys.create(7, "test").await.unwrap();
        state.ledger.grant(7, 10.0).await.unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/v1/sessions"))
            .bearer_auth(&key)
            .json(&json!({
                "conversation_id": 1,
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        let id = body["data"]["session_id"].as_str().unwrap().to_string();
        assert!(body["_links"]["stream"].is_string());

        let mut status = String::new();
        for _ in 0..100 {
            let body: Value = client
                .get(format!("{base}/api/v1/sessions/{id}"))
                .bearer_auth(&key)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            status = body["data"]["status"].as_str().unwrap().to_string();
            if status != "pending" && status != "processing" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, "error");

        // The prompt was recorded against the conversation.
        let messages = state.conversations.messages(7, 1).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_other_users_session_is_hidden() {
        let (base, state, _dir) = spawn_server().await;
        let record = state
            .registry()
            .create_session(1, 1, "gpt-4o", vec![])
            .unwrap();
        let key = state.api_keys.create(2, "other").await.unwrap();

        let resp = reqwest::Client::new()
            .get(format!("{base}/api/v1/sessions/{}", record.id()))
            .header("X-API-Key", &key)
            .send()
            .await
            .unwrap();
        assert_ne!(resp.status(), 200);
    }
}
