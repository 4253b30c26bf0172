//! The embeddable cluster node
//!
//! [`Node`] wires the manager, the remote handlers, the local modification
//! cache, and the client trackers together.

pub mod config;
pub mod manager;
pub mod services;

use std::sync::{Arc, Weak};

use tracing::{info, warn};

use concord_common::{ClassId, Configuration, NodeId, NodeState, Result, Serial};
use concord_consistency::{ClassHierarchy, ModificationCache, ModificationConfig};
use concord_persistence::{ChangeLogPersistence, NodeRegistryPersistence};

pub use config::NodeConfig;
pub use manager::{Coordination, Membership, NodeManager};

use crate::event::{
    ClusterEvent, ClusterEventListener, ClusterEventPublisher, LoggingClusterEventListener,
};
use crate::remote::{ServiceRegistry, names};
use crate::tracker::{LockTracker, ModificationTracker, OperationTracker, SerialTracker};

/// Keeps the modification cache consistent with membership changes
struct ModificationListener {
    cache: Arc<ModificationCache>,
    manager: Weak<NodeManager>,
}

#[async_trait::async_trait]
impl ClusterEventListener for ModificationListener {
    fn priority(&self) -> i32 {
        -10
    }

    async fn on_event(&self, event: &ClusterEvent) -> anyhow::Result<()> {
        match event {
            ClusterEvent::NodeStateChanged {
                previous: NodeState::Connected,
                ..
            } => {
                // Commit broadcasts no longer reach this node
                self.cache.suspend_coverage();
            }
            ClusterEvent::NodeLeft { node_id } => {
                if self.cache.orphan_node(*node_id) > 0 {
                    self.cache.resolve_orphans().await?;
                }
            }
            ClusterEvent::CoordinatorChanged { coordinator_id } => {
                // Outcomes broadcast by the old coordinator may be lost, and
                // until the new serial is known nothing is covered
                self.cache.suspend_coverage();
                self.cache.orphan_all();

                let Some(manager) = self.manager.upgrade() else {
                    return Ok(());
                };
                let serial: Serial = manager
                    .call_to_coordinator(names::SERIAL, names::SERIAL_NEXT, &())
                    .await?;
                manager.observe_serial(serial);
                self.cache.begin_coverage(serial);
                info!(
                    "Modification tracking resumed at {} under coordinator {}",
                    serial, coordinator_id
                );
                self.cache.resolve_orphans().await?;
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct Node {
    manager: Arc<NodeManager>,
    hierarchy: Arc<ClassHierarchy>,
    serials: SerialTracker,
    operations: OperationTracker,
    locks: LockTracker,
    modifications: ModificationTracker,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        modification: ModificationConfig,
        registry: Arc<dyn NodeRegistryPersistence>,
        change_log: Arc<dyn ChangeLogPersistence>,
    ) -> Self {
        let hierarchy = Arc::new(ClassHierarchy::new());
        let cache = Arc::new(ModificationCache::new(
            modification,
            hierarchy.clone(),
            change_log,
        ));
        let services = Arc::new(ServiceRegistry::new());
        let events = Arc::new(ClusterEventPublisher::default());

        let manager = NodeManager::new(
            config,
            registry,
            services.clone(),
            events.clone(),
            hierarchy.clone(),
            cache.clone(),
        );
        services::register_services(&services, &manager, &cache);

        events.register_listener(Arc::new(ModificationListener {
            cache: cache.clone(),
            manager: Arc::downgrade(&manager),
        }));
        events.register_listener(Arc::new(LoggingClusterEventListener));

        Self {
            serials: SerialTracker::new(manager.clone()),
            operations: OperationTracker::new(manager.clone()),
            locks: LockTracker::new(manager.clone()),
            modifications: ModificationTracker::new(cache),
            hierarchy,
            manager,
        }
    }

    pub fn from_configuration(
        config: &Configuration,
        registry: Arc<dyn NodeRegistryPersistence>,
        change_log: Arc<dyn ChangeLogPersistence>,
    ) -> Self {
        Self::new(
            NodeConfig::from_configuration(config),
            ModificationConfig::from_configuration(config),
            registry,
            change_log,
        )
    }

    /// Join the group, electing a coordinator if needed
    pub async fn start(&self) -> Result<NodeId> {
        let node_id = self.manager.start().await?;
        info!(
            "Node {} started as {} (coordinator {:?})",
            node_id,
            self.manager.role(),
            self.manager.coordinator_id()
        );
        Ok(node_id)
    }

    /// Leave the group and release the registry row
    pub async fn shutdown(&self) -> Result<()> {
        let node_id = self.manager.id();
        if let Err(err) = self.manager.shutdown().await {
            warn!("Node {:?} did not shut down cleanly: {}", node_id, err);
            return Err(err);
        }
        info!("Node {:?} shut down", node_id);
        Ok(())
    }

    /// Declare a persistent class and its direct parents
    pub fn register_class(&self, class: impl Into<ClassId>, parents: Vec<ClassId>) {
        self.hierarchy.register(class.into(), parents);
    }

    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    pub fn events(&self) -> &Arc<ClusterEventPublisher> {
        self.manager.events()
    }

    pub fn hierarchy(&self) -> &Arc<ClassHierarchy> {
        &self.hierarchy
    }

    pub fn serials(&self) -> &SerialTracker {
        &self.serials
    }

    pub fn operations(&self) -> &OperationTracker {
        &self.operations
    }

    pub fn locks(&self) -> &LockTracker {
        &self.locks
    }

    pub fn modifications(&self) -> &ModificationTracker {
        &self.modifications
    }
}
