//! Core chain synchronization functionality
//!
//! - [`store`]: TTL-indexed entry store with expiry notifications
//! - [`sync`]: Keeps the managed chain consistent with the store
//! - [`runner`]: Firewall command model and the `iptables` runner
//! - [`snapshot`]: Optional persistence of the store across restarts
//! - [`error`]: Error types for chain operations

pub mod error;
pub mod runner;
pub mod snapshot;
pub mod store;
pub mod sync;

#[cfg(test)]
pub mod test_helpers;
