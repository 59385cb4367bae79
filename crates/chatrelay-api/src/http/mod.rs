//! HTTP/REST API layer for chatrelay.
//!
//! Axum-based REST API at `/api/v1/` with API key authentication,
//! envelope response format, and a WebSocket progress stream.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
