//! Concord Persistence - Node registry and change-log storage
//!
//! This crate provides:
//! - SeaORM entities for the shared node-registry and change-log tables
//! - Persistence traits consumed by the node manager and modification cache
//! - An external database backend (MySQL/PostgreSQL via SeaORM)
//! - An in-memory backend for single-process clusters and tests
//! - A conservative change log for nodes without storage access

pub mod entity;
pub mod memory;
pub mod model;
pub mod sql;
pub mod traits;
pub mod unknown;

// Re-export sea-orm for convenience
pub use sea_orm;

// Re-export persistence traits
pub use traits::{ChangeLogPersistence, NodeRegistryPersistence};

// Re-export backends
pub use memory::MemoryPersistService;
pub use sql::ExternalDbPersistService;
pub use unknown::UnknownChangeLog;

// Re-export model types
pub use model::NodeRegistration;
