//! SQLite storage layer.
//!
//! Store implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod api_key;
pub mod cache;
pub mod conversation;
pub mod pool;
pub mod quota;
