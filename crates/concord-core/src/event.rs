//! Cluster event handling
//!
//! Publishes node state changes, remote disconnects, and commit finalization
//! to priority-ordered listeners.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use concord_common::{NodeId, NodeState, Serial};

/// Cluster event
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterEvent {
    /// The local node moved between lifecycle states
    NodeStateChanged {
        node_id: NodeId,
        previous: NodeState,
        current: NodeState,
    },
    /// A participant completed its handshake with this coordinator
    NodeJoined { node_id: NodeId },
    /// A remote node disconnected; its locks and commit windows are gone
    NodeLeft { node_id: NodeId },
    /// A (possibly new) coordinator was elected or found
    CoordinatorChanged { coordinator_id: NodeId },
    CommitFinalized { tx_serial: Serial, committed: bool },
}

impl std::fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterEvent::NodeStateChanged { .. } => write!(f, "NODE_STATE_CHANGED"),
            ClusterEvent::NodeJoined { .. } => write!(f, "NODE_JOINED"),
            ClusterEvent::NodeLeft { .. } => write!(f, "NODE_LEFT"),
            ClusterEvent::CoordinatorChanged { .. } => write!(f, "COORDINATOR_CHANGED"),
            ClusterEvent::CommitFinalized { .. } => write!(f, "COMMIT_FINALIZED"),
        }
    }
}

/// How listener failures are treated during a publish
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Every listener runs; failures are logged and reported in aggregate
    Guaranteed,
    /// The first failing listener aborts the publish
    Strict,
}

/// Trait for handling cluster events
#[async_trait::async_trait]
pub trait ClusterEventListener: Send + Sync {
    /// Listeners with a lower priority run first
    fn priority(&self) -> i32 {
        0
    }

    async fn on_event(&self, event: &ClusterEvent) -> anyhow::Result<()>;
}

/// Cluster event publisher
pub struct ClusterEventPublisher {
    broadcast_tx: broadcast::Sender<ClusterEvent>,
    /// Kept sorted by priority
    listeners: RwLock<Vec<Arc<dyn ClusterEventListener>>>,
}

impl ClusterEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size.max(1));
        Self {
            broadcast_tx,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn ClusterEventListener>) {
        let mut listeners = self.listeners.write();
        let at = listeners.partition_point(|l| l.priority() <= listener.priority());
        listeners.insert(at, listener);
        debug!("Registered cluster event listener, total: {}", listeners.len());
    }

    /// Publish an event to every listener in priority order.
    ///
    /// Returns `Ok(true)` when every listener succeeded. Under
    /// [`Delivery::Guaranteed`] failures and panics are logged and yield
    /// `Ok(false)`; under [`Delivery::Strict`] the first failure is returned.
    pub async fn publish(&self, event: ClusterEvent, delivery: Delivery) -> anyhow::Result<bool> {
        debug!("Publishing cluster event {}: {:?}", event, event);

        let _ = self.broadcast_tx.send(event.clone());

        let listeners = self.listeners.read().clone();
        let mut all_ok = true;
        for listener in listeners {
            let outcome = AssertUnwindSafe(listener.on_event(&event))
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(_) => anyhow::anyhow!("listener panicked"),
            };

            match delivery {
                Delivery::Strict => return Err(failure.context(format!("delivering {}", event))),
                Delivery::Guaranteed => {
                    warn!("Listener failed on {}: {:#}", event, failure);
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }

    /// Subscribe to every published event
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.broadcast_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for ClusterEventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A simple logging listener
pub struct LoggingClusterEventListener;

#[async_trait::async_trait]
impl ClusterEventListener for LoggingClusterEventListener {
    fn priority(&self) -> i32 {
        i32::MAX
    }

    async fn on_event(&self, event: &ClusterEvent) -> anyhow::Result<()> {
        match event {
            ClusterEvent::NodeStateChanged {
                node_id,
                previous,
                current,
            } => info!("[ClusterEvent] Node {} {} -> {}", node_id, previous, current),
            ClusterEvent::NodeJoined { node_id } => {
                info!("[ClusterEvent] Node {} joined", node_id)
            }
            ClusterEvent::NodeLeft { node_id } => info!("[ClusterEvent] Node {} left", node_id),
            ClusterEvent::CoordinatorChanged { coordinator_id } => {
                info!("[ClusterEvent] Coordinator is node {}", coordinator_id)
            }
            ClusterEvent::CommitFinalized {
                tx_serial,
                committed,
            } => debug!(
                "[ClusterEvent] Transaction {} {}",
                tx_serial,
                if *committed { "committed" } else { "rolled back" }
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        priority: i32,
        seen: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ClusterEventListener for Recorder {
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn on_event(&self, _event: &ClusterEvent) -> anyhow::Result<()> {
            self.seen.lock().push(self.name);
            if self.fail {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        priority: i32,
        fail: bool,
        seen: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn ClusterEventListener> {
        Arc::new(Recorder {
            name,
            priority,
            seen: seen.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_listeners_run_in_priority_order() {
        let publisher = ClusterEventPublisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        publisher.register_listener(recorder("late", 10, false, &seen));
        publisher.register_listener(recorder("early", -5, false, &seen));
        publisher.register_listener(recorder("middle", 0, false, &seen));

        let ok = publisher
            .publish(ClusterEvent::NodeLeft { node_id: 2 }, Delivery::Guaranteed)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(*seen.lock(), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn test_guaranteed_delivery_swallows_failures() {
        let publisher = ClusterEventPublisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        publisher.register_listener(recorder("first", 0, true, &seen));
        publisher.register_listener(recorder("second", 1, false, &seen));

        let ok = publisher
            .publish(ClusterEvent::NodeJoined { node_id: 3 }, Delivery::Guaranteed)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_strict_delivery_aborts_on_first_failure() {
        let publisher = ClusterEventPublisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        publisher.register_listener(recorder("first", 0, true, &seen));
        publisher.register_listener(recorder("second", 1, false, &seen));

        let result = publisher
            .publish(
                ClusterEvent::CoordinatorChanged { coordinator_id: 1 },
                Delivery::Strict,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(*seen.lock(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let publisher = ClusterEventPublisher::default();
        let mut rx = publisher.subscribe();

        let event = ClusterEvent::CommitFinalized {
            tx_serial: Serial(99),
            committed: true,
        };
        publisher
            .publish(event.clone(), Delivery::Guaranteed)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
