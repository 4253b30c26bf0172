//! Persistence traits consumed by the cluster core
//!
//! The node manager only needs the node-registry table; the modification
//! cache needs a way to ask storage for the last committed change when its
//! own window cannot answer.

pub mod change_log;
pub mod registry;

pub use change_log::ChangeLogPersistence;
pub use registry::NodeRegistryPersistence;
