//! Route handlers.

pub mod session;
pub mod ws;
