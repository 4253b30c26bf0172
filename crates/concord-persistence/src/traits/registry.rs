//! Node registry persistence trait

use async_trait::async_trait;

use concord_common::{NodeId, Result};

use crate::model::NodeRegistration;

/// Access to the shared node-registry table
#[async_trait]
pub trait NodeRegistryPersistence: Send + Sync {
    /// Create the registry table if it does not exist yet
    async fn ensure_table(&self) -> Result<()>;

    /// All registered nodes, ordered by ascending node index
    async fn search_all(&self) -> Result<Vec<NodeRegistration>>;

    /// Insert a new row. Returns `false` if the node index is already taken.
    async fn insert(&self, registration: &NodeRegistration) -> Result<bool>;

    /// Insert or update a row
    async fn save(&self, registration: &NodeRegistration) -> Result<()>;

    /// Remove a row. Returns `true` if a row was deleted.
    async fn remove(&self, node_index: NodeId) -> Result<bool>;
}
