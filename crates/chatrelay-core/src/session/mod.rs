//! Generation session lifecycle.
//!
//! - [`record`]: one session's state plus its runtime-only fields
//! - [`registry`]: the in-memory map, lookup indices and terminal transitions
//! - [`persistence`] / [`writer`]: durable snapshots and the async write queue
//! - [`recovery`]: startup re-admission of durable snapshots
//! - [`sweeper`]: periodic eviction of stale sessions

pub mod cancel;
pub mod persistence;
pub mod record;
pub mod recovery;
pub mod registry;
pub mod sweeper;
pub mod writer;

/// Error message recorded when a stale snapshot is resurrected.
pub const RECOVERY_EXPIRED_MESSAGE: &str = "Session expired during recovery";

/// Error message recorded when a resurrected snapshot collides with a newer
/// active session for the same conversation.
pub const SUPERSEDED_MESSAGE: &str = "Session superseded by a newer session";

/// Generic message for failures that are not the upstream's fault.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";
