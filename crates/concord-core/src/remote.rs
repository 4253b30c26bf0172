//! Remote service registry
//!
//! Maps `(service, method)` to a typed handler. Handlers are registered at
//! startup; inbound requests and local coordinator calls both dispatch
//! through here, so a call behaves the same whether it ran locally or
//! crossed the wire.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use concord_common::{ConcordError, NodeId, Result};

/// Service and method names used between nodes
pub mod names {
    pub const SERIAL: &str = "serial";
    pub const SERIAL_NEXT: &str = "next";

    pub const FENCE: &str = "fence";
    pub const FENCE_START: &str = "start_commit";
    pub const FENCE_END: &str = "end_commit";
    pub const FENCE_WAIT: &str = "wait_for_query";

    pub const LOCK: &str = "lock";
    pub const LOCK_ACQUIRE: &str = "lock";
    pub const LOCK_RELEASE: &str = "unlock";
    pub const LOCK_RELEASE_ALL: &str = "unlock_all";

    pub const MODIFICATION: &str = "modification";
    pub const MODIFICATION_PREPARE: &str = "prepare";
    pub const MODIFICATION_FINALIZE: &str = "finalize";
    pub const MODIFICATION_ABORT: &str = "abort";

    pub const NODE: &str = "node";
    pub const NODE_BROADCAST: &str = "broadcast";
    pub const NODE_LEFT: &str = "left";
    pub const NODE_PING: &str = "ping";
}

/// One invocation, local or remote
#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub caller: NodeId,
    pub service: String,
    pub method: String,
    pub payload: Value,
}

#[async_trait]
pub trait RemoteHandler: Send + Sync {
    async fn handle(&self, caller: NodeId, payload: Value) -> Result<Value>;
}

/// Adapts an async fn over typed arguments to a [`RemoteHandler`]
struct TypedHandler<A, R, F> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

#[async_trait]
impl<A, R, F, Fut> RemoteHandler for TypedHandler<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(NodeId, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    async fn handle(&self, caller: NodeId, payload: Value) -> Result<Value> {
        let args: A = serde_json::from_value(payload)?;
        let result = (self.f)(caller, args).await?;
        Ok(serde_json::to_value(result)?)
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    handlers: DashMap<(String, String), Arc<dyn RemoteHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, service: &str, method: &str, handler: Arc<dyn RemoteHandler>) {
        info!(
            service = %service,
            method = %method,
            "Registering remote handler {}.{}",
            service,
            method
        );
        self.handlers
            .insert((service.to_string(), method.to_string()), handler);
    }

    /// Register an async fn taking deserialized arguments
    pub fn register<A, R, F, Fut>(&self, service: &str, method: &str, f: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(NodeId, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.register_handler(
            service,
            method,
            Arc::new(TypedHandler {
                f,
                _marker: PhantomData,
            }),
        );
    }

    pub fn unregister(&self, service: &str, method: &str) -> bool {
        self.handlers
            .remove(&(service.to_string(), method.to_string()))
            .is_some()
    }

    pub fn contains(&self, service: &str, method: &str) -> bool {
        self.handlers
            .contains_key(&(service.to_string(), method.to_string()))
    }

    pub async fn dispatch(&self, call: RemoteCall) -> Result<Value> {
        let handler = self
            .handlers
            .get(&(call.service.clone(), call.method.clone()))
            .map(|h| h.value().clone())
            .ok_or_else(|| ConcordError::UnknownOperation {
                service: call.service.clone(),
                method: call.method.clone(),
            })?;

        debug!(
            "Dispatching {}.{} from node {}",
            call.service, call.method, call.caller
        );
        handler.handle(call.caller, call.payload).await
    }
}
