//! Node assembly and run loop

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use concord_common::Configuration;
use concord_consistency::ModificationCache;
use concord_core::Node;
use concord_persistence::{
    ChangeLogPersistence, ExternalDbPersistService, MemoryPersistService, NodeRegistryPersistence,
    UnknownChangeLog,
};

use super::shutdown::{ShutdownSignal, run_with_shutdown};

const MIN_EVICTION_INTERVAL: Duration = Duration::from_secs(1);

/// Storage backends a node runs against
pub struct Backends {
    pub registry: Arc<dyn NodeRegistryPersistence>,
    pub change_log: Arc<dyn ChangeLogPersistence>,
}

/// Pick the storage backends from `db.url`.
///
/// With a database both the registry and the change log live there.
/// Without one every node of the group must share this process, and the
/// change log cannot vouch for anything the cache has not seen itself.
pub async fn connect_backends(configuration: &Configuration) -> anyhow::Result<Backends> {
    match configuration.db_url() {
        Some(url) => {
            info!("Node registry and change log: external database");
            let store = Arc::new(ExternalDbPersistService::connect(&url).await?);
            store.ensure_change_log().await?;
            Ok(Backends {
                registry: store.clone(),
                change_log: store,
            })
        }
        None => {
            warn!("No db.url configured, using an in-process node registry");
            Ok(Backends {
                registry: Arc::new(MemoryPersistService::new()),
                change_log: Arc::new(UnknownChangeLog),
            })
        }
    }
}

/// Evict expired modification records every quarter of their lifetime,
/// settling orphaned changes a failed sweep left behind
pub fn spawn_eviction(cache: Arc<ModificationCache>, max_age: Duration) -> JoinHandle<()> {
    let period = (max_age / 4).max(MIN_EVICTION_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = cache.resolve_orphans().await {
                warn!("Orphaned changes not resolved: {}", err);
            }
            let evicted = cache.evict_expired();
            if evicted > 0 {
                debug!("Evicted {} expired modification records", evicted);
            }
        }
    })
}

/// Start a node, keep it in the group until `shutdown` fires, then leave
pub async fn run_node(
    configuration: &Configuration,
    backends: Backends,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    let node = Node::from_configuration(configuration, backends.registry, backends.change_log);
    let Some(started) = run_with_shutdown(node.start(), shutdown.subscribe()).await else {
        info!("Shutdown requested while joining the group");
        node.shutdown().await?;
        return Ok(());
    };
    let node_id = started?;

    let max_age = Duration::from_millis(configuration.modification_max_age_ms());
    let eviction = spawn_eviction(node.modifications().cache().clone(), max_age);

    info!(
        "Concord node {} listening on port {:?}",
        node_id,
        node.manager().port()
    );

    let _ = shutdown_rx.recv().await;
    eviction.abort();

    node.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_common::config::NODE_HOST;
    use concord_common::{ClassId, ObjectId, Serial};
    use concord_consistency::{ClassHierarchy, ModificationConfig};

    #[tokio::test]
    async fn test_memory_backends_without_db_url() {
        let configuration = Configuration::default();
        let backends = connect_backends(&configuration).await.unwrap();
        assert!(backends.registry.search_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_log_without_db_never_vouches() {
        let configuration = Configuration::default();
        let backends = connect_backends(&configuration).await.unwrap();
        let config = ModificationConfig {
            max_records: 1,
            max_age: Duration::from_secs(3600),
        };
        let cache = ModificationCache::new(
            config,
            Arc::new(ClassHierarchy::new()),
            backends.change_log.clone(),
        );
        cache.begin_coverage(Serial(100));

        let first = ObjectId::new(ClassId::new("Order"), 1);
        let second = ObjectId::new(ClassId::new("Order"), 2);
        cache.finalize(Serial(200), std::slice::from_ref(&first));
        cache.finalize(Serial(300), std::slice::from_ref(&second));

        // The record for the first change is gone; only the horizon remains
        assert!(cache.record(&first).is_none());
        assert!(!cache.is_object_current(&first, Serial(150)).await.unwrap());
        assert!(cache.is_object_current(&first, Serial(300)).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_node_until_shutdown() {
        let configuration =
            Configuration::load(None, &[(NODE_HOST, "127.0.0.1".to_string())]).unwrap();
        let backends = connect_backends(&configuration).await.unwrap();
        let registry = backends.registry.clone();
        let signal = ShutdownSignal::new();

        let runner = {
            let signal = signal.clone();
            tokio::spawn(async move { run_node(&configuration, backends, signal).await })
        };

        let mut registered = false;
        for _ in 0..100 {
            if registry.search_all().await.unwrap().len() == 1 {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registered);

        signal.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(registry.search_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eviction_task_drops_expired_records() {
        let hierarchy = Arc::new(ClassHierarchy::new());
        let storage = Arc::new(MemoryPersistService::new());
        let config = ModificationConfig {
            max_records: 100,
            max_age: Duration::from_millis(200),
        };
        let cache = Arc::new(ModificationCache::new(config, hierarchy, storage));
        let order = ObjectId::new(ClassId::new("Order"), 1);
        cache.finalize(Serial(10), std::slice::from_ref(&order));
        cache.prepare(4, Serial(20), &[ObjectId::new(ClassId::new("Order"), 2)]);
        cache.orphan_node(4);
        assert_eq!(cache.len(), 2);

        let task = spawn_eviction(cache.clone(), Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.abort();
        assert!(cache.is_empty());
        assert_eq!(cache.pending_count(), 0);
    }
}
