//! Upstream model clients.

pub mod cached;
pub mod openai_compat;
