//! chainward - TTL-bounded iptables allow-lists
//!
//! Maintains a time-bounded allow-list of addresses in a single iptables
//! chain and keeps an in-process record synchronized with the chain's rules.
//!
//! # Architecture
//!
//! - [`core`] - Entry store, chain synchronizer and iptables interaction
//! - [`audit`] - Audit logging for chain mutations
//! - [`command`] - Line protocol read by `chainward run`
//! - [`validators`] - Input validation for command-line arguments
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Optional sudo/run0 prefix for firewall commands
//! - [`utils`] - XDG directories and binary resolution

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod command;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::runner::{ChainCommand, CommandRunner, IptablesRunner};
pub use core::sync::{ChainSync, SyncEvent, SyncSettings};
