//! Processing pipeline: the background task that drives one session from
//! `pending` to a terminal state.
//!
//! - [`collaborators`]: traits for the model provider, quota ledger and
//!   conversation store
//! - [`buffer`]: accumulates model chunks into the final text
//! - [`processor`]: the pipeline itself

pub mod buffer;
pub mod collaborators;
pub mod processor;
