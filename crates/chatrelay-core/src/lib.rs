//! Business logic for the chatrelay generation-session manager.
//!
//! This crate defines the session registry, the durable-snapshot adapter and
//! its recovery procedure, progress delivery to observers, and the processing
//! pipeline. External systems (durable cache, model provider, quota ledger,
//! conversation store) are reached through the traits in [`cache`] and
//! [`pipeline::collaborators`]; implementations live in chatrelay-infra.

pub mod cache;
pub mod delivery;
pub mod pipeline;
pub mod service;
pub mod session;
