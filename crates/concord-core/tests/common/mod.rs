//! Shared helpers for multi-node tests
//!
//! Every node runs in this process on 127.0.0.1 against one in-memory
//! registry and change log.

use std::sync::Arc;
use std::time::Duration;

use concord_consistency::ModificationConfig;
use concord_core::{Node, NodeConfig};
use concord_persistence::{
    ChangeLogPersistence, MemoryPersistService, NodeRegistration, NodeRegistryPersistence,
};

/// Node settings with short retry and probe intervals
pub fn fast_config() -> NodeConfig {
    NodeConfig {
        hosts: vec!["127.0.0.1".to_string()],
        probe_timeout: Duration::from_millis(200),
        retry_delay: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

pub struct TestCluster {
    pub storage: Arc<MemoryPersistService>,
}

#[allow(dead_code)]
impl TestCluster {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(MemoryPersistService::new()),
        }
    }

    pub fn node(&self) -> Node {
        self.node_with(ModificationConfig::default(), self.storage.clone())
    }

    /// A node with its own cache settings and change log
    pub fn node_with(
        &self,
        modification: ModificationConfig,
        change_log: Arc<dyn ChangeLogPersistence>,
    ) -> Node {
        Node::new(fast_config(), modification, self.storage.clone(), change_log)
    }

    pub async fn started_node(&self) -> Node {
        let node = self.node();
        node.start().await.expect("node failed to start");
        node
    }

    /// Register a row whose port nobody listens on
    pub async fn register_dead(&self, node_index: i64) {
        let port = dead_port().await;
        self.storage
            .insert(&NodeRegistration::new(
                node_index,
                vec!["127.0.0.1".to_string()],
                port,
            ))
            .await
            .expect("registry insert failed");
    }

    pub async fn registered_ids(&self) -> Vec<i64> {
        self.storage
            .search_all()
            .await
            .expect("registry read failed")
            .into_iter()
            .map(|row| row.node_index)
            .collect()
    }
}

/// A port that was just free
pub async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind failed");
    listener.local_addr().expect("no local addr").port()
}

/// Poll `check` until it holds or `timeout` passes
#[allow(dead_code)]
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
