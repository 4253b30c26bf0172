//! In-memory persistence backend
//!
//! Shared by every node running inside one process, and by tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use concord_common::{ClassId, NodeId, ObjectId, Result, Serial};

use crate::model::NodeRegistration;
use crate::traits::{ChangeLogPersistence, NodeRegistryPersistence};

/// In-memory node registry and change log
#[derive(Default)]
pub struct MemoryPersistService {
    nodes: Mutex<BTreeMap<NodeId, NodeRegistration>>,
    object_changes: DashMap<ObjectId, Serial>,
    class_changes: DashMap<ClassId, Serial>,
}

impl MemoryPersistService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed change to an object, as the storage engine would
    pub fn record_change(&self, object: &ObjectId, serial: Serial) {
        self.object_changes
            .entry(object.clone())
            .and_modify(|s| *s = (*s).max(serial))
            .or_insert(serial);
        self.class_changes
            .entry(object.class.clone())
            .and_modify(|s| *s = (*s).max(serial))
            .or_insert(serial);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }
}

#[async_trait]
impl NodeRegistryPersistence for MemoryPersistService {
    async fn ensure_table(&self) -> Result<()> {
        Ok(())
    }

    async fn search_all(&self) -> Result<Vec<NodeRegistration>> {
        Ok(self.nodes.lock().values().cloned().collect())
    }

    async fn insert(&self, registration: &NodeRegistration) -> Result<bool> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&registration.node_index) {
            return Ok(false);
        }
        nodes.insert(registration.node_index, registration.clone());
        Ok(true)
    }

    async fn save(&self, registration: &NodeRegistration) -> Result<()> {
        self.nodes
            .lock()
            .insert(registration.node_index, registration.clone());
        Ok(())
    }

    async fn remove(&self, node_index: NodeId) -> Result<bool> {
        Ok(self.nodes.lock().remove(&node_index).is_some())
    }
}

#[async_trait]
impl ChangeLogPersistence for MemoryPersistService {
    async fn last_object_change(&self, object: &ObjectId) -> Result<Option<Serial>> {
        Ok(self.object_changes.get(object).map(|s| *s))
    }

    async fn last_class_change(&self, classes: &[ClassId]) -> Result<Option<Serial>> {
        Ok(classes
            .iter()
            .filter_map(|class| self.class_changes.get(class).map(|s| *s))
            .max())
    }
}
