//! Distributed lock registry
//!
//! This module provides:
//! - Lock data model (owners, entries, requests, grants)
//! - Class hierarchy closure used for hierarchical conflicts
//! - The coordinator-side lock table with blocking acquisition

mod hierarchy;
mod model;
mod service;

pub use hierarchy::*;
pub use model::*;
pub use service::*;
