//! Shared domain types for chatrelay.
//!
//! This crate contains the types shared by every layer of the session
//! manager: session records and their durable snapshots, chat messages and
//! upstream chunks, push-channel events, configuration, and error enums.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod session;
