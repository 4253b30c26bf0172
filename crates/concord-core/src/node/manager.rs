//! Node membership, coordinator election, and call routing
//!
//! Moves the local node through OFFLINE -> UNINITIALIZED -> INITIALIZED ->
//! CONNECTED one level at a time and owns every transport endpoint.

use std::sync::atomic::{AtomicI64, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use concord_common::{ConcordError, NodeId, NodeRole, NodeState, Result, Serial};
use concord_consistency::{
    ClassHierarchy, CommitFence, CurrencyCheck, LockRegistry, SerialGenerator,
};
use concord_persistence::{NodeRegistration, NodeRegistryPersistence};

use super::config::NodeConfig;
use crate::event::{ClusterEvent, ClusterEventPublisher, Delivery};
use crate::remote::{RemoteCall, ServiceRegistry, names};
use crate::transport::{Endpoint, Envelope, LossCallback, WorkerPool, read_frame, write_frame};

/// Time a peer gets to answer a hello
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Redirects followed before falling back to the probed node
const MAX_REDIRECTS: usize = 3;

/// NotReady answers tolerated per configured retry
const NOT_READY_FACTOR: u32 = 5;

/// Coordinator-only state, created on election and dropped on step-down
pub struct Coordination {
    pub serials: Arc<SerialGenerator>,
    pub fence: Arc<CommitFence>,
    pub locks: Arc<LockRegistry>,
}

/// Snapshot of the local node's identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Membership {
    pub state: NodeState,
    pub role: NodeRole,
    pub node_id: Option<NodeId>,
    pub coordinator_id: Option<NodeId>,
}

/// A call a participant asks the coordinator to fan out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastArgs {
    pub service: String,
    pub method: String,
    pub payload: Value,
}

enum Route {
    Local(NodeId),
    Remote(Endpoint),
}

enum Handshake {
    Welcome(TcpStream, NodeId),
    Redirect(NodeId),
    NotReady,
    Unreachable,
}

enum JoinOutcome {
    Joined(NodeId),
    /// Nothing accepted a TCP connection at any published address
    Unreachable,
    /// Alive, but never ready to accept us
    Busy,
}

pub struct NodeManager {
    config: NodeConfig,
    registry: Arc<dyn NodeRegistryPersistence>,
    services: Arc<ServiceRegistry>,
    events: Arc<ClusterEventPublisher>,
    hierarchy: Arc<ClassHierarchy>,
    currency: Arc<dyn CurrencyCheck>,
    pool: WorkerPool,
    self_ref: Weak<NodeManager>,
    membership: RwLock<Membership>,
    /// Serializes state transitions
    transition: tokio::sync::Mutex<()>,
    /// Last id this process held; never handed out again
    last_id: AtomicI64,
    port: AtomicU16,
    /// Highest serial this node has seen issued
    max_serial: AtomicI64,
    listener: Mutex<Option<JoinHandle<()>>>,
    coordinator_link: RwLock<Option<Endpoint>>,
    participants: DashMap<NodeId, Endpoint>,
    coordination: RwLock<Option<Arc<Coordination>>>,
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("membership", &self.membership())
            .field("port", &self.port())
            .field("participants", &self.participants.len())
            .finish()
    }
}

impl NodeManager {
    pub fn new(
        config: NodeConfig,
        registry: Arc<dyn NodeRegistryPersistence>,
        services: Arc<ServiceRegistry>,
        events: Arc<ClusterEventPublisher>,
        hierarchy: Arc<ClassHierarchy>,
        currency: Arc<dyn CurrencyCheck>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            pool: WorkerPool::new(config.workers.clone()),
            config,
            registry,
            services,
            events,
            hierarchy,
            currency,
            self_ref: self_ref.clone(),
            membership: RwLock::new(Membership::default()),
            transition: tokio::sync::Mutex::new(()),
            last_id: AtomicI64::new(0),
            port: AtomicU16::new(0),
            max_serial: AtomicI64::new(0),
            listener: Mutex::new(None),
            coordinator_link: RwLock::new(None),
            participants: DashMap::new(),
            coordination: RwLock::new(None),
        })
    }

    // ===================== Identity =====================

    pub fn membership(&self) -> Membership {
        *self.membership.read()
    }

    pub fn id(&self) -> Option<NodeId> {
        self.membership.read().node_id
    }

    pub fn node_id(&self) -> Result<NodeId> {
        self.id()
            .ok_or_else(|| ConcordError::IllegalState("node has no id yet".to_string()))
    }

    pub fn role(&self) -> NodeRole {
        self.membership.read().role
    }

    pub fn state(&self) -> NodeState {
        self.membership.read().state
    }

    pub fn coordinator_id(&self) -> Option<NodeId> {
        self.membership.read().coordinator_id
    }

    pub fn is_coordinator(&self) -> bool {
        let membership = self.membership.read();
        membership.state == NodeState::Connected && membership.role == NodeRole::Coordinator
    }

    /// Command port, once the node is initialized
    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    /// Participants connected to this coordinator
    pub fn participant_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.participants.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `node_id` is this node or one of its live participants
    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.id() == Some(node_id)
            || self
                .participants
                .get(&node_id)
                .is_some_and(|e| !e.is_closed())
    }

    pub fn coordination(&self) -> Option<Arc<Coordination>> {
        self.coordination.read().clone()
    }

    /// Coordinator state, or `IllegalState` on a participant
    pub fn require_coordination(&self) -> Result<Arc<Coordination>> {
        self.coordination().ok_or_else(|| {
            ConcordError::IllegalState(format!(
                "node {:?} is not the coordinator",
                self.id()
            ))
        })
    }

    pub fn observe_serial(&self, serial: Serial) {
        self.max_serial.fetch_max(serial.value(), Ordering::AcqRel);
    }

    pub fn max_observed_serial(&self) -> Serial {
        Serial(self.max_serial.load(Ordering::Acquire))
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn events(&self) -> &Arc<ClusterEventPublisher> {
        &self.events
    }

    pub fn hierarchy(&self) -> &Arc<ClassHierarchy> {
        &self.hierarchy
    }

    // ===================== Lifecycle =====================

    /// Move up until CONNECTED
    pub async fn start(&self) -> Result<NodeId> {
        let _guard = self.transition.lock().await;
        while self.state() != NodeState::Connected {
            self.step_up().await?;
        }
        self.node_id()
    }

    /// Move down until OFFLINE
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        while self.state() != NodeState::Offline {
            self.step_down().await?;
        }
        Ok(())
    }

    /// Move one level up
    pub async fn move_up(&self) -> Result<NodeState> {
        let _guard = self.transition.lock().await;
        self.step_up().await
    }

    /// Move one level down
    pub async fn move_down(&self) -> Result<NodeState> {
        let _guard = self.transition.lock().await;
        self.step_down().await
    }

    /// Move one level up only if still at `expected`
    async fn move_up_from(&self, expected: NodeState) -> Result<Option<NodeState>> {
        let _guard = self.transition.lock().await;
        if self.state() != expected {
            return Ok(None);
        }
        self.step_up().await.map(Some)
    }

    async fn step_up(&self) -> Result<NodeState> {
        let previous = self.state();
        let Some(next) = previous.up() else {
            return Ok(previous);
        };

        let mut coordinator_changed = None;
        match previous {
            NodeState::Offline => self.registry.ensure_table().await?,
            NodeState::Uninitialized => self.initialize().await?,
            NodeState::Initialized => {
                let (role, coordinator_id) = self.connect().await?;
                let mut membership = self.membership.write();
                membership.role = role;
                membership.coordinator_id = Some(coordinator_id);
                coordinator_changed = Some(coordinator_id);
            }
            NodeState::Connected => {}
        }

        self.set_state(previous, next).await;
        if let Some(coordinator_id) = coordinator_changed {
            self.publish(ClusterEvent::CoordinatorChanged { coordinator_id })
                .await;
        }
        Ok(next)
    }

    async fn step_down(&self) -> Result<NodeState> {
        let previous = self.state();
        let Some(next) = previous.down() else {
            return Ok(previous);
        };

        match previous {
            NodeState::Connected => {
                self.leave_group();
                let mut membership = self.membership.write();
                membership.role = NodeRole::Undecided;
                membership.coordinator_id = None;
            }
            NodeState::Initialized => self.deinitialize().await,
            NodeState::Uninitialized | NodeState::Offline => {}
        }

        self.set_state(previous, next).await;
        Ok(next)
    }

    async fn set_state(&self, previous: NodeState, current: NodeState) {
        let node_id = {
            let mut membership = self.membership.write();
            membership.state = current;
            membership.node_id
        };
        info!(
            "Node {:?} moved from {} to {} ({})",
            node_id,
            previous,
            current,
            self.role()
        );
        self.publish(ClusterEvent::NodeStateChanged {
            node_id: node_id.unwrap_or_default(),
            previous,
            current,
        })
        .await;
    }

    async fn publish(&self, event: ClusterEvent) {
        if let Err(err) = self.events.publish(event, Delivery::Guaranteed).await {
            warn!("Cluster event delivery failed: {:#}", err);
        }
    }

    /// Open the command listener and claim a registry row
    async fn initialize(&self) -> Result<()> {
        let listener = TcpListener::bind((self.config.bind_host(), self.config.port)).await?;
        let port = listener.local_addr()?.port();
        let node_id = self.acquire_id(port).await?;

        self.port.store(port, Ordering::Release);
        self.membership.write().node_id = Some(node_id);
        *self.listener.lock() = Some(tokio::spawn(Self::accept_loop(
            self.self_ref.clone(),
            listener,
        )));

        info!(
            "Node {} listening on port {} (published as {:?})",
            node_id, port, self.config.hosts
        );
        Ok(())
    }

    /// Claim one past the highest registered id, never reusing an id this
    /// process held before
    async fn acquire_id(&self, port: u16) -> Result<NodeId> {
        for attempt in 1..=self.config.register_attempts.max(1) {
            let highest = self
                .registry
                .search_all()
                .await?
                .iter()
                .map(|row| row.node_index)
                .max()
                .unwrap_or(0);
            let candidate = highest.max(self.last_id.load(Ordering::Acquire)) + 1;

            let registration = NodeRegistration::new(candidate, self.config.hosts.clone(), port);
            if self.registry.insert(&registration).await? {
                self.last_id.store(candidate, Ordering::Release);
                return Ok(candidate);
            }
            debug!(
                "Node id {} was taken concurrently (attempt {})",
                candidate, attempt
            );
        }

        Err(ConcordError::IllegalState(format!(
            "no free node id after {} attempts",
            self.config.register_attempts
        )))
    }

    async fn deinitialize(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        self.port.store(0, Ordering::Release);

        let node_id = self.membership.write().node_id.take();
        if let Some(node_id) = node_id {
            match self.registry.remove(node_id).await {
                Ok(_) => info!("Node {} removed from registry", node_id),
                Err(err) => warn!("Failed to remove node {} from registry: {}", node_id, err),
            }
        }
    }

    // ===================== Election =====================

    /// Join the first reachable lower-id node, or become coordinator
    async fn connect(&self) -> Result<(NodeRole, NodeId)> {
        let node_id = self.node_id()?;
        let mut lower: Vec<NodeRegistration> = self
            .registry
            .search_all()
            .await?
            .into_iter()
            .filter(|row| row.node_index < node_id)
            .collect();
        lower.sort_by_key(|row| row.node_index);

        let mut unreachable = Vec::new();
        let mut busy = false;
        for row in &lower {
            match self.join(node_id, row).await? {
                JoinOutcome::Joined(coordinator_id) => {
                    info!(
                        "Node {} joined coordinator {} as participant",
                        node_id, coordinator_id
                    );
                    return Ok((NodeRole::Participant, coordinator_id));
                }
                JoinOutcome::Unreachable => unreachable.push(row.node_index),
                JoinOutcome::Busy => busy = true,
            }
        }

        if busy {
            return Err(ConcordError::CommunicationFailure(
                "lower nodes are alive but not ready".to_string(),
            ));
        }

        for dead in unreachable {
            if self.registry.remove(dead).await? {
                info!("Removed unreachable node {} from registry", dead);
            }
        }

        self.become_coordinator(node_id);
        Ok((NodeRole::Coordinator, node_id))
    }

    async fn join(&self, node_id: NodeId, row: &NodeRegistration) -> Result<JoinOutcome> {
        let max_not_ready = self.config.max_retries.max(1) * NOT_READY_FACTOR;
        let mut not_ready = 0;
        let mut target = row.clone();
        let mut hops = 0;

        loop {
            match self.handshake(node_id, &target).await {
                Handshake::Welcome(stream, coordinator_id) => {
                    self.install_coordinator_link(node_id, coordinator_id, stream);
                    return Ok(JoinOutcome::Joined(coordinator_id));
                }
                Handshake::Unreachable if hops == 0 => {
                    debug!("Node {} is unreachable", row.node_index);
                    return Ok(JoinOutcome::Unreachable);
                }
                Handshake::Redirect(coordinator_id)
                    if hops < MAX_REDIRECTS && coordinator_id != node_id =>
                {
                    let next = self
                        .registry
                        .search_all()
                        .await?
                        .into_iter()
                        .find(|r| r.node_index == coordinator_id);
                    if let Some(next) = next {
                        debug!(
                            "Node {} redirected us to coordinator {}",
                            target.node_index, coordinator_id
                        );
                        target = next;
                        hops += 1;
                        continue;
                    }
                }
                _ => {}
            }

            not_ready += 1;
            if not_ready > max_not_ready {
                warn!(
                    "Node {} stayed not ready after {} attempts",
                    row.node_index, not_ready
                );
                return Ok(JoinOutcome::Busy);
            }
            target = row.clone();
            hops = 0;
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    async fn handshake(&self, node_id: NodeId, row: &NodeRegistration) -> Handshake {
        for address in row.socket_addresses() {
            let stream = match tokio::time::timeout(
                self.config.probe_timeout,
                TcpStream::connect(address.as_str()),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!("Probe of node {} at {} failed: {}", row.node_index, address, err);
                    continue;
                }
                Err(_) => {
                    debug!("Probe of node {} at {} timed out", row.node_index, address);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            return match self.exchange_hello(node_id, stream).await {
                Ok(handshake) => handshake,
                Err(err) => {
                    debug!("Handshake with node {} failed: {}", row.node_index, err);
                    Handshake::NotReady
                }
            };
        }
        Handshake::Unreachable
    }

    async fn exchange_hello(&self, node_id: NodeId, mut stream: TcpStream) -> Result<Handshake> {
        let hello = Envelope::Hello {
            node_id,
            max_serial: self.max_observed_serial(),
        };
        write_frame(&mut stream, &hello).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| ConcordError::Timeout("no handshake reply".to_string()))??;

        Ok(match reply {
            Some(Envelope::Welcome { coordinator_id }) => Handshake::Welcome(stream, coordinator_id),
            Some(Envelope::Redirect { coordinator_id }) => Handshake::Redirect(coordinator_id),
            Some(Envelope::NotReady) | None => Handshake::NotReady,
            Some(other) => {
                return Err(ConcordError::IllegalState(format!(
                    "unexpected {} during handshake",
                    other.kind()
                )));
            }
        })
    }

    fn become_coordinator(&self, node_id: NodeId) {
        let serials = Arc::new(SerialGenerator::new());
        serials.ensure_above(self.max_observed_serial());
        let fence = Arc::new(CommitFence::new(serials.clone()));
        let locks = Arc::new(
            LockRegistry::new(self.hierarchy.clone()).with_currency_check(self.currency.clone()),
        );

        *self.coordination.write() = Some(Arc::new(Coordination {
            serials,
            fence,
            locks,
        }));
        metrics::counter!("concord_elections_won_total").increment(1);
        info!("Node {} is now the coordinator", node_id);
    }

    /// Close every endpoint and drop coordinator state
    fn leave_group(&self) {
        if let Some(link) = self.coordinator_link.write().take() {
            link.shutdown();
        }

        let ids: Vec<NodeId> = self.participants.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, endpoint)) = self.participants.remove(&id) {
                endpoint.shutdown();
            }
        }
        metrics::gauge!("concord_cluster_participants").set(0.0);

        let coordination = self.coordination.write().take();
        if let Some(coordination) = coordination {
            self.observe_serial(coordination.serials.last_issued());
            coordination.locks.clear();
            for window in coordination.fence.open_windows() {
                coordination.fence.release_node(window.node_id);
            }
            info!("Stepped down as coordinator");
        }
    }

    // ===================== Connections =====================

    fn install_coordinator_link(&self, node_id: NodeId, coordinator_id: NodeId, stream: TcpStream) {
        let weak = self.self_ref.clone();
        let on_loss: LossCallback = Box::new(move |peer, cause| {
            spawn_with(weak, move |manager| async move {
                manager.on_coordinator_lost(peer, cause).await
            })
        });

        let endpoint = Endpoint::spawn(
            stream,
            node_id,
            coordinator_id,
            self.config.endpoint.clone(),
            self.services.clone(),
            self.pool.clone(),
            Some(on_loss),
        );
        if let Some(old) = self.coordinator_link.write().replace(endpoint) {
            old.shutdown();
        }
    }

    fn install_participant(&self, node_id: NodeId, peer: NodeId, stream: TcpStream) -> Endpoint {
        let weak = self.self_ref.clone();
        let on_loss: LossCallback = Box::new(move |peer, cause| {
            spawn_with(weak, move |manager| async move {
                manager.on_participant_lost(peer, cause).await
            })
        });

        let endpoint = Endpoint::spawn(
            stream,
            node_id,
            peer,
            self.config.endpoint.clone(),
            self.services.clone(),
            self.pool.clone(),
            Some(on_loss),
        );
        self.participants.insert(peer, endpoint.clone());
        metrics::gauge!("concord_cluster_participants").set(self.participants.len() as f64);
        endpoint
    }

    async fn accept_loop(weak: Weak<NodeManager>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Accept failed: {}", err);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let _ = stream.set_nodelay(true);
            tokio::spawn(async move {
                if let Err(err) = manager.handle_inbound(stream).await {
                    debug!("Inbound connection from {} dropped: {}", addr, err);
                }
            });
        }
    }

    async fn handle_inbound(&self, mut stream: TcpStream) -> Result<()> {
        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| ConcordError::Timeout("no hello received".to_string()))??;
        let Some(Envelope::Hello {
            node_id: peer,
            max_serial,
        }) = hello
        else {
            return Err(ConcordError::IllegalState(
                "connection did not start with hello".to_string(),
            ));
        };
        self.observe_serial(max_serial);

        let membership = self.membership();
        let coordination = self.coordination();
        let (node_id, coordination) = match (membership, coordination) {
            (
                Membership {
                    state: NodeState::Connected,
                    role: NodeRole::Coordinator,
                    node_id: Some(node_id),
                    ..
                },
                Some(coordination),
            ) => (node_id, coordination),
            (
                Membership {
                    state: NodeState::Connected,
                    role: NodeRole::Participant,
                    coordinator_id: Some(coordinator_id),
                    ..
                },
                _,
            ) => {
                return write_frame(&mut stream, &Envelope::Redirect { coordinator_id }).await;
            }
            _ => return write_frame(&mut stream, &Envelope::NotReady).await,
        };

        coordination.serials.ensure_above(max_serial);

        // A node reconnecting before its old link was noticed dead
        if let Some((_, stale)) = self.participants.remove(&peer) {
            stale.shutdown();
            self.broadcast_node_left(peer).await;
        }

        write_frame(&mut stream, &Envelope::Welcome { coordinator_id: node_id }).await?;
        let endpoint = self.install_participant(node_id, peer, stream);

        if !self.is_coordinator() {
            self.participants.remove(&peer);
            endpoint.shutdown();
            return Ok(());
        }

        info!("Node {} joined as participant", peer);
        self.publish(ClusterEvent::NodeJoined { node_id: peer }).await;
        Ok(())
    }

    async fn on_participant_lost(&self, peer: NodeId, cause: ConcordError) {
        if self
            .participants
            .remove_if(&peer, |_, endpoint| endpoint.is_closed())
            .is_none()
        {
            return;
        }
        metrics::gauge!("concord_cluster_participants").set(self.participants.len() as f64);
        warn!("Lost participant {}: {}", peer, cause);
        self.broadcast_node_left(peer).await;
    }

    async fn broadcast_node_left(&self, peer: NodeId) {
        if let Err(err) = self.call_to_all(names::NODE, names::NODE_LEFT, &peer).await {
            warn!("Node-left broadcast for {} failed: {}", peer, err);
        }
    }

    /// Reclaim a departed node's locks and commit windows, then notify
    /// local listeners
    pub async fn handle_node_left(&self, node_id: NodeId) {
        if let Some(coordination) = self.coordination() {
            let windows = coordination.fence.release_node(node_id);
            let locks = coordination.locks.release_node(node_id);
            debug!(
                "Reclaimed {} commit windows and {} lock entries of node {}",
                windows, locks, node_id
            );
        }
        self.publish(ClusterEvent::NodeLeft { node_id }).await;
    }

    async fn on_coordinator_lost(self: Arc<Self>, peer: NodeId, cause: ConcordError) {
        {
            let _guard = self.transition.lock().await;
            let membership = self.membership();
            let link_dead = self
                .coordinator_link
                .read()
                .as_ref()
                .is_some_and(|link| link.peer_id() == peer && link.is_closed());
            if membership.state != NodeState::Connected
                || membership.role != NodeRole::Participant
                || membership.coordinator_id != Some(peer)
                || !link_dead
            {
                debug!("Ignoring loss of former coordinator {}", peer);
                return;
            }

            error!("Lost connection to coordinator {}: {}", peer, cause);
            metrics::counter!("concord_coordinator_losses_total").increment(1);
            if let Err(err) = self.step_down().await {
                warn!("Step down after coordinator loss failed: {}", err);
            }
        }

        self.publish(ClusterEvent::NodeLeft { node_id: peer }).await;
        self.reconnect().await;
    }

    /// Retry the election until connected or moved elsewhere
    async fn reconnect(&self) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.move_up_from(NodeState::Initialized).await {
                Ok(Some(_)) => {
                    info!("Reconnected after {} attempts", attempt);
                    return;
                }
                Ok(None) => return,
                Err(err) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, err);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    // ===================== Routing =====================

    fn route(&self) -> Result<Route> {
        let membership = self.membership();
        match (membership.state, membership.role, membership.node_id) {
            (NodeState::Connected, NodeRole::Coordinator, Some(node_id)) => Ok(Route::Local(node_id)),
            (NodeState::Connected, NodeRole::Participant, _) => self
                .coordinator_link
                .read()
                .clone()
                .filter(|link| !link.is_closed())
                .map(Route::Remote)
                .ok_or_else(|| {
                    ConcordError::CommunicationFailure(
                        "coordinator connection is down".to_string(),
                    )
                }),
            (state, _, _) => Err(ConcordError::CommunicationFailure(format!(
                "node is {}, not connected",
                state
            ))),
        }
    }

    /// Invoke an operation on the coordinator, locally if this node is it
    pub async fn call_to_coordinator<A, R>(&self, service: &str, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(args)?;
        let value = self.call_to_coordinator_raw(service, method, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_to_coordinator_raw(
        &self,
        service: &str,
        method: &str,
        payload: Value,
    ) -> Result<Value> {
        let mut attempt = 0;
        loop {
            let result = match self.route() {
                Ok(Route::Local(node_id)) => {
                    return self
                        .services
                        .dispatch(RemoteCall {
                            caller: node_id,
                            service: service.to_string(),
                            method: method.to_string(),
                            payload,
                        })
                        .await;
                }
                Ok(Route::Remote(link)) => {
                    self.remote_call(&link, service, method, payload.clone())
                        .await
                }
                Err(err) => Err(err),
            };

            match result {
                Err(err) if err.is_transport() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Coordinator call {}.{} failed ({}), retry {}/{}",
                        service, method, err, attempt, self.config.max_retries
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    /// Invoke an operation on every connected node, this one included
    pub async fn call_to_all<A>(&self, service: &str, method: &str, args: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(args)?;
        self.call_to_all_raw(service, method, payload).await
    }

    pub async fn call_to_all_raw(&self, service: &str, method: &str, payload: Value) -> Result<()> {
        match self.route()? {
            Route::Local(node_id) => self.fan_out(node_id, service, method, payload).await,
            Route::Remote(_) => {
                let args = serde_json::to_value(BroadcastArgs {
                    service: service.to_string(),
                    method: method.to_string(),
                    payload,
                })?;
                self.call_to_coordinator_raw(names::NODE, names::NODE_BROADCAST, args)
                    .await?;
                Ok(())
            }
        }
    }

    /// Coordinator side of a broadcast: run locally and on every
    /// participant, waiting for all of them.
    ///
    /// A participant failing at the transport level is skipped; its loss is
    /// handled by the disconnect path. The first handler error is returned.
    pub async fn fan_out(
        &self,
        caller: NodeId,
        service: &str,
        method: &str,
        payload: Value,
    ) -> Result<()> {
        if !self.is_coordinator() {
            return Err(ConcordError::IllegalState(
                "only the coordinator fans out broadcasts".to_string(),
            ));
        }

        let participants: Vec<Endpoint> = self
            .participants
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let local = self.services.dispatch(RemoteCall {
            caller,
            service: service.to_string(),
            method: method.to_string(),
            payload: payload.clone(),
        });
        let remote = join_all(
            participants
                .iter()
                .map(|link| self.remote_call(link, service, method, payload.clone())),
        );
        let (local, remote) = tokio::join!(local, remote);

        let mut first_error = local.err();
        for (link, result) in participants.iter().zip(remote) {
            match result {
                Ok(_) => {}
                Err(err) if err.is_transport() => warn!(
                    "Participant {} missed {}.{}: {}",
                    link.peer_id(),
                    service,
                    method,
                    err
                ),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn remote_call(
        &self,
        link: &Endpoint,
        service: &str,
        method: &str,
        payload: Value,
    ) -> Result<Value> {
        let id = link.send_request(service, method, payload)?;
        let outcome = match self.config.request_timeout {
            None => link.wait_response(id).await?,
            Some(limit) => match tokio::time::timeout(limit, link.wait_response(id)).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    link.abandon(id);
                    return Err(ConcordError::Timeout(format!(
                        "{}.{} on node {} exceeded {:?}",
                        service,
                        method,
                        link.peer_id(),
                        limit
                    )));
                }
            },
        };
        outcome
    }
}

/// Run `f` on the runtime if the manager is still alive
fn spawn_with<F, Fut>(weak: Weak<NodeManager>, f: F)
where
    F: FnOnce(Arc<NodeManager>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Some(manager) = weak.upgrade() else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(f(manager));
        }
        Err(_) => warn!("No runtime available to handle a lost connection"),
    }
}
