//! Remote handlers every node registers at startup
//!
//! Coordinator-only operations fail with `IllegalState` on a participant;
//! broadcast targets (modification lifecycle, node-left) run everywhere.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use concord_common::{ConcordError, LockTarget, NodeId, ObjectId, Result, Serial};
use concord_consistency::{LockGrant, LockOwner, LockRequest, ModificationCache};

use super::manager::{BroadcastArgs, NodeManager};
use crate::event::{ClusterEvent, Delivery};
use crate::remote::{ServiceRegistry, names};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndCommitArgs {
    pub serial: Serial,
    pub tx_serial: Serial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForQueryArgs {
    pub serial: Serial,
    /// `None` waits until no lower commit is open
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockArgs {
    pub owner: LockOwner,
    pub targets: Vec<LockTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareArgs {
    /// Node running the commit
    pub node_id: NodeId,
    pub tx_serial: Serial,
    pub objects: Vec<ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeArgs {
    pub tx_serial: Serial,
    pub objects: Vec<ObjectId>,
}

fn upgrade(manager: &Weak<NodeManager>) -> Result<Arc<NodeManager>> {
    manager
        .upgrade()
        .ok_or_else(|| ConcordError::IllegalState("node is shut down".to_string()))
}

fn check_owner(owner: &LockOwner, caller: NodeId) -> Result<()> {
    if owner.node_id != caller {
        return Err(ConcordError::IllegalState(format!(
            "node {} cannot act for lock owner {}",
            caller, owner
        )));
    }
    Ok(())
}

/// Register every coordinator and broadcast handler
pub fn register_services(
    services: &ServiceRegistry,
    manager: &Arc<NodeManager>,
    modifications: &Arc<ModificationCache>,
) {
    register_serial_services(services, Arc::downgrade(manager));
    register_fence_services(services, Arc::downgrade(manager));
    register_lock_services(services, Arc::downgrade(manager));
    register_modification_services(services, Arc::downgrade(manager), modifications.clone());
    register_node_services(services, Arc::downgrade(manager));
}

fn register_serial_services(services: &ServiceRegistry, manager: Weak<NodeManager>) {
    services.register(names::SERIAL, names::SERIAL_NEXT, move |_, _: ()| {
        let manager = manager.clone();
        async move { upgrade(&manager)?.require_coordination()?.serials.next_serial() }
    });
}

fn register_fence_services(services: &ServiceRegistry, manager: Weak<NodeManager>) {
    let start = manager.clone();
    services.register(names::FENCE, names::FENCE_START, move |caller, _: ()| {
        let manager = start.clone();
        async move {
            upgrade(&manager)?
                .require_coordination()?
                .fence
                .start_commit(caller)
        }
    });

    let end = manager.clone();
    services.register(
        names::FENCE,
        names::FENCE_END,
        move |caller, args: EndCommitArgs| {
            let manager = end.clone();
            async move {
                upgrade(&manager)?.require_coordination()?.fence.end_commit(
                    caller,
                    args.serial,
                    args.tx_serial,
                )
            }
        },
    );

    services.register(
        names::FENCE,
        names::FENCE_WAIT,
        move |_, args: WaitForQueryArgs| {
            let manager = manager.clone();
            async move {
                let fence = upgrade(&manager)?.require_coordination()?.fence.clone();
                fence
                    .wait_for_query(args.serial, args.timeout_ms.map(Duration::from_millis))
                    .await
            }
        },
    );
}

fn register_lock_services(services: &ServiceRegistry, manager: Weak<NodeManager>) {
    let acquire = manager.clone();
    services.register(
        names::LOCK,
        names::LOCK_ACQUIRE,
        move |caller, request: LockRequest| {
            let manager = acquire.clone();
            async move {
                check_owner(&request.owner, caller)?;
                let manager = upgrade(&manager)?;
                let locks = manager.require_coordination()?.locks.clone();
                let owner = request.owner;
                let targets = request.canonical_targets();

                let grant = locks.lock(request).await?;

                // The caller may have left while this call waited
                if grant.is_granted() && !manager.is_member(caller) {
                    locks.unlock(&owner, &targets);
                    return Err(ConcordError::CommunicationFailure(format!(
                        "node {} left before its lock was granted",
                        caller
                    )));
                }
                Ok::<LockGrant, ConcordError>(grant)
            }
        },
    );

    let release = manager.clone();
    services.register(
        names::LOCK,
        names::LOCK_RELEASE,
        move |caller, args: UnlockArgs| {
            let manager = release.clone();
            async move {
                check_owner(&args.owner, caller)?;
                Ok(upgrade(&manager)?
                    .require_coordination()?
                    .locks
                    .unlock(&args.owner, &args.targets))
            }
        },
    );

    services.register(
        names::LOCK,
        names::LOCK_RELEASE_ALL,
        move |caller, owner: LockOwner| {
            let manager = manager.clone();
            async move {
                check_owner(&owner, caller)?;
                Ok(upgrade(&manager)?
                    .require_coordination()?
                    .locks
                    .unlock_all(&owner))
            }
        },
    );
}

fn register_modification_services(
    services: &ServiceRegistry,
    manager: Weak<NodeManager>,
    modifications: Arc<ModificationCache>,
) {
    let cache = modifications.clone();
    services.register(
        names::MODIFICATION,
        names::MODIFICATION_PREPARE,
        move |_, args: PrepareArgs| {
            let cache = cache.clone();
            async move {
                cache.prepare(args.node_id, args.tx_serial, &args.objects);
                Ok(())
            }
        },
    );

    let cache = modifications.clone();
    let finalize = manager.clone();
    services.register(
        names::MODIFICATION,
        names::MODIFICATION_FINALIZE,
        move |_, args: FinalizeArgs| {
            let cache = cache.clone();
            let manager = finalize.clone();
            async move {
                cache.finalize(args.tx_serial, &args.objects);
                publish_commit(&manager, args.tx_serial, true).await;
                Ok(())
            }
        },
    );

    services.register(
        names::MODIFICATION,
        names::MODIFICATION_ABORT,
        move |_, tx_serial: Serial| {
            let cache = modifications.clone();
            let manager = manager.clone();
            async move {
                cache.abort(tx_serial);
                publish_commit(&manager, tx_serial, false).await;
                Ok(())
            }
        },
    );
}

async fn publish_commit(manager: &Weak<NodeManager>, tx_serial: Serial, committed: bool) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    manager.observe_serial(tx_serial);
    let event = ClusterEvent::CommitFinalized {
        tx_serial,
        committed,
    };
    if let Err(err) = manager.events().publish(event, Delivery::Guaranteed).await {
        warn!("Commit event for {} not delivered: {:#}", tx_serial, err);
    }
}

fn register_node_services(services: &ServiceRegistry, manager: Weak<NodeManager>) {
    let broadcast = manager.clone();
    services.register(
        names::NODE,
        names::NODE_BROADCAST,
        move |caller, args: BroadcastArgs| {
            let manager = broadcast.clone();
            async move {
                debug!(
                    "Fanning out {}.{} for node {}",
                    args.service, args.method, caller
                );
                upgrade(&manager)?
                    .fan_out(caller, &args.service, &args.method, args.payload)
                    .await
            }
        },
    );

    let left = manager.clone();
    services.register(names::NODE, names::NODE_LEFT, move |_, node_id: NodeId| {
        let manager = left.clone();
        async move {
            upgrade(&manager)?.handle_node_left(node_id).await;
            Ok(())
        }
    });

    services.register(names::NODE, names::NODE_PING, move |_, _: ()| {
        let manager = manager.clone();
        async move { upgrade(&manager)?.node_id() }
    });
}
