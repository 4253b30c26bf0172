//! Concord Common - Shared types, errors, and utilities
//!
//! This crate provides the foundational types used across all Concord components:
//! - Error taxonomy shared by every node and carried over the wire
//! - Node identity, serial, and lock target model types
//! - Layered configuration access
//! - Utility functions

pub mod config;
pub mod error;
pub mod model;
pub mod utils;

// Re-exports for convenience
pub use config::Configuration;
pub use error::{ConcordError, Result};
pub use model::{ClassId, LockTarget, NodeId, NodeRole, NodeState, ObjectId, Serial};
pub use utils::{current_timestamp, local_ips};
