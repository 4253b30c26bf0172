//! Point-to-point endpoint over one established connection
//!
//! Outbound frames go through a single writer task, so sends are ordered
//! per connection. Inbound requests are handed to the shared worker pool;
//! responses are matched to waiters by correlation id. When the connection
//! dies every blocked waiter fails and the loss callback fires once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use concord_common::{ConcordError, NodeId, Result};

use super::codec::{Envelope, RequestId, read_frame, write_frame};
use super::pool::WorkerPool;
use crate::remote::{RemoteCall, ServiceRegistry};

/// Outcome of a remote call: the outer error is a transport failure, the
/// inner one was raised by the remote handler
pub type RemoteOutcome = std::result::Result<Value, ConcordError>;

/// Invoked once when the connection is lost, with the peer id and cause
pub type LossCallback = Box<dyn FnOnce(NodeId, ConcordError) + Send>;

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Unclaimed responses older than this are purged
    pub response_ttl: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            response_ttl: Duration::from_secs(60),
        }
    }
}

enum Slot {
    Waiting(oneshot::Sender<Result<RemoteOutcome>>),
    Arrived(Instant, RemoteOutcome),
}

struct EndpointInner {
    local_id: NodeId,
    peer_id: NodeId,
    config: EndpointConfig,
    outbound: mpsc::UnboundedSender<Envelope>,
    slots: DashMap<RequestId, Slot>,
    next_id: AtomicU64,
    closed: AtomicBool,
    on_loss: Mutex<Option<LossCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to one connection
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_id", &self.inner.local_id)
            .field("peer_id", &self.inner.peer_id)
            .field("closed", &self.is_closed())
            .field("in_flight", &self.inner.slots.len())
            .finish()
    }
}

impl Endpoint {
    /// Take over an established, already hand-shaken stream
    pub fn spawn<S>(
        stream: S,
        local_id: NodeId,
        peer_id: NodeId,
        config: EndpointConfig,
        services: Arc<ServiceRegistry>,
        pool: WorkerPool,
        on_loss: Option<LossCallback>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let endpoint = Endpoint {
            inner: Arc::new(EndpointInner {
                local_id,
                peer_id,
                config,
                outbound,
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                on_loss: Mutex::new(on_loss),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let writer_task = tokio::spawn(endpoint.clone().write_loop(writer, outbound_rx));
        let reader_task = tokio::spawn(endpoint.clone().read_loop(reader, services, pool));
        let reaper_task = tokio::spawn(endpoint.clone().reap_loop());
        endpoint
            .inner
            .tasks
            .lock()
            .extend([writer_task, reader_task, reaper_task]);

        debug!("Endpoint {} -> {} started", local_id, peer_id);
        endpoint
    }

    pub fn peer_id(&self) -> NodeId {
        self.inner.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Fire-and-forget, ordered with every other send on this connection
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.inner
            .outbound
            .send(envelope)
            .map_err(|_| self.closed_error())
    }

    /// One-way invocation, no response expected
    pub fn notify(&self, service: &str, method: &str, payload: Value) -> Result<()> {
        self.send(Envelope::Notify {
            caller: self.inner.local_id,
            service: service.to_string(),
            method: method.to_string(),
            payload,
        })
    }

    /// Send a request and return its correlation id without waiting
    pub fn send_request(&self, service: &str, method: &str, payload: Value) -> Result<RequestId> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(Envelope::Request {
            id,
            caller: self.inner.local_id,
            service: service.to_string(),
            method: method.to_string(),
            payload,
        })?;
        Ok(id)
    }

    /// Wait for the response to a request sent earlier, also if it already
    /// arrived
    pub async fn wait_response(&self, id: RequestId) -> Result<RemoteOutcome> {
        let receiver = match self.inner.slots.entry(id) {
            Entry::Occupied(entry) => match entry.remove() {
                Slot::Arrived(_, outcome) => return Ok(outcome),
                Slot::Waiting(_) => {
                    return Err(ConcordError::IllegalState(format!(
                        "request {} already has a waiter",
                        id
                    )));
                }
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(Slot::Waiting(tx));
                rx
            }
        };

        // Teardown may have drained the slots just before the insert
        if self.is_closed() {
            self.inner.slots.remove(&id);
            return Err(self.closed_error());
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Stop waiting for a request; a late response is purged as unclaimed
    pub fn abandon(&self, id: RequestId) {
        self.inner.slots.remove(&id);
    }

    pub async fn send_and_wait(
        &self,
        service: &str,
        method: &str,
        payload: Value,
    ) -> Result<RemoteOutcome> {
        let id = self.send_request(service, method, payload)?;
        self.wait_response(id).await
    }

    /// Tear the connection down, failing every waiter
    pub fn close(&self, cause: ConcordError) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let ids: Vec<RequestId> = self.inner.slots.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, Slot::Waiting(tx))) = self.inner.slots.remove(&id) {
                let _ = tx.send(Err(cause.clone()));
                failed += 1;
            }
        }
        self.inner.slots.clear();

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        warn!(
            "Connection {} -> {} closed ({}), failed {} waiters",
            self.inner.local_id, self.inner.peer_id, cause, failed
        );

        let callback = self.inner.on_loss.lock().take();
        if let Some(callback) = callback {
            callback(self.inner.peer_id, cause);
        }
    }

    /// Close without invoking the loss callback (orderly shutdown)
    pub fn shutdown(&self) {
        self.inner.on_loss.lock().take();
        self.close(ConcordError::CommunicationFailure(
            "endpoint shut down".to_string(),
        ));
    }

    fn closed_error(&self) -> ConcordError {
        ConcordError::CommunicationFailure(format!(
            "connection to node {} is closed",
            self.inner.peer_id
        ))
    }

    fn complete(&self, id: RequestId, outcome: RemoteOutcome) {
        match self.inner.slots.entry(id) {
            Entry::Occupied(entry) => {
                if matches!(entry.get(), Slot::Waiting(_))
                    && let Slot::Waiting(tx) = entry.remove()
                {
                    let _ = tx.send(Ok(outcome));
                } else {
                    warn!("Duplicate response {} from node {}", id, self.inner.peer_id);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Arrived(Instant::now(), outcome));
            }
        }
    }

    async fn write_loop<W>(self, mut writer: W, mut outbound: mpsc::UnboundedReceiver<Envelope>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(envelope) = outbound.recv().await {
            if let Err(err) = write_frame(&mut writer, &envelope).await {
                error!(
                    "Write of {} to node {} failed: {}",
                    envelope.kind(),
                    self.inner.peer_id,
                    err
                );
                self.close(err);
                return;
            }
        }
    }

    async fn read_loop<R>(self, mut reader: R, services: Arc<ServiceRegistry>, pool: WorkerPool)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let envelope = match read_frame(&mut reader).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    self.close(ConcordError::CommunicationFailure(format!(
                        "node {} closed the connection",
                        self.inner.peer_id
                    )));
                    return;
                }
                Err(err) => {
                    self.close(err);
                    return;
                }
            };

            match envelope {
                Envelope::Response { id, outcome } => self.complete(id, outcome),
                Envelope::Request {
                    id,
                    caller,
                    service,
                    method,
                    payload,
                } => {
                    let endpoint = self.clone();
                    let services = services.clone();
                    pool.execute(async move {
                        let outcome = services
                            .dispatch(RemoteCall {
                                caller,
                                service,
                                method,
                                payload,
                            })
                            .await;
                        if let Err(err) = endpoint.send(Envelope::Response { id, outcome }) {
                            debug!("Response {} not delivered: {}", id, err);
                        }
                    });
                }
                Envelope::Notify {
                    caller,
                    service,
                    method,
                    payload,
                } => {
                    let services = services.clone();
                    pool.execute(async move {
                        let call = RemoteCall {
                            caller,
                            service,
                            method,
                            payload,
                        };
                        if let Err(err) = services.dispatch(call).await {
                            warn!("Notification from node {} failed: {}", caller, err);
                        }
                    });
                }
                other => warn!(
                    "Unexpected {} frame from node {} after handshake",
                    other.kind(),
                    self.inner.peer_id
                ),
            }
        }
    }

    async fn reap_loop(self) {
        let ttl = self.inner.config.response_ttl;
        let mut ticker = tokio::time::interval((ttl / 2).max(Duration::from_millis(10)));
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let before = self.inner.slots.len();
            self.inner.slots.retain(|_, slot| match slot {
                Slot::Arrived(at, _) => now.duration_since(*at) < ttl,
                Slot::Waiting(_) => true,
            });
            let purged = before.saturating_sub(self.inner.slots.len());
            if purged > 0 {
                debug!(
                    "Purged {} unclaimed responses from node {}",
                    purged, self.inner.peer_id
                );
            }
        }
    }
}
