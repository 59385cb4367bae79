//! Infrastructure layer for chatrelay.
//!
//! Contains implementations of the ports defined in `chatrelay-core`:
//! the SQLite-backed TTL cache, conversation store and quota ledger, the
//! OpenAI-compatible upstream model client, and the config file loader.

pub mod config;
pub mod llm;
pub mod sqlite;
