//! Durable key-value cache abstractions.
//!
//! Defines the `CacheStore` port used for session snapshots, its boxed
//! dynamic-dispatch wrapper, and an in-process implementation.

pub mod box_store;
pub mod memory;
pub mod store;
