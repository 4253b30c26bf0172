//! Concord Core - Cluster membership, transport, and client trackers
//!
//! This crate provides:
//! - Length-delimited wire envelopes and per-connection endpoints
//! - A remote service registry dispatching `(service, method)` calls
//! - Cluster event publishing with priority-ordered listeners
//! - The node manager: id acquisition, coordinator election, routing
//! - Client facades for serials, commit fencing, locks, and currency

pub mod event;
pub mod node;
pub mod remote;
pub mod tracker;
pub mod transport;

pub use event::{
    ClusterEvent, ClusterEventListener, ClusterEventPublisher, Delivery,
    LoggingClusterEventListener,
};
pub use node::{Coordination, Membership, Node, NodeConfig, NodeManager};
pub use remote::{RemoteCall, RemoteHandler, ServiceRegistry};
pub use tracker::{LockTracker, ModificationTracker, OperationTracker, SerialTracker};
