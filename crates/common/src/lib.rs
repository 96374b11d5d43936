//! Shared identifiers and synchronization primitives used across the
//! fulfillment crates.

pub mod locks;
pub mod types;

pub use locks::KeyedLocks;
pub use types::AggregateId;
