//! Client facades over the coordinator services
//!
//! Every call here works the same on the coordinator and on a participant:
//! the node manager routes it locally or over the wire.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use concord_common::{ClassId, LockTarget, ObjectId, Result, Serial};
use concord_consistency::{LockGrant, LockOwner, LockRequest, LockWait, ModificationCache};

use crate::node::manager::NodeManager;
use crate::node::services::{
    EndCommitArgs, FinalizeArgs, PrepareArgs, UnlockArgs, WaitForQueryArgs,
};
use crate::remote::names;

/// Issues globally ordered serials
#[derive(Clone)]
pub struct SerialTracker {
    manager: Arc<NodeManager>,
}

impl SerialTracker {
    pub fn new(manager: Arc<NodeManager>) -> Self {
        Self { manager }
    }

    pub async fn next_serial(&self) -> Result<Serial> {
        let serial: Serial = self
            .manager
            .call_to_coordinator(names::SERIAL, names::SERIAL_NEXT, &())
            .await?;
        self.manager.observe_serial(serial);
        Ok(serial)
    }
}

/// Milliseconds for the wire, saturating instead of wrapping
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Commit windows and query barriers
#[derive(Clone)]
pub struct OperationTracker {
    manager: Arc<NodeManager>,
}

impl OperationTracker {
    pub fn new(manager: Arc<NodeManager>) -> Self {
        Self { manager }
    }

    /// Open a commit window and return its visibility serial
    pub async fn start_commit(&self) -> Result<Serial> {
        let serial: Serial = self
            .manager
            .call_to_coordinator(names::FENCE, names::FENCE_START, &())
            .await?;
        self.manager.observe_serial(serial);
        Ok(serial)
    }

    pub async fn end_commit(&self, serial: Serial, tx_serial: Serial) -> Result<()> {
        self.manager
            .call_to_coordinator(
                names::FENCE,
                names::FENCE_END,
                &EndCommitArgs { serial, tx_serial },
            )
            .await
    }

    /// Block until every commit at or below `serial` has finished
    pub async fn wait_for_query(&self, serial: Serial, timeout: Option<Duration>) -> Result<()> {
        let args = WaitForQueryArgs {
            serial,
            timeout_ms: timeout.map(saturating_millis),
        };
        self.manager
            .call_to_coordinator(names::FENCE, names::FENCE_WAIT, &args)
            .await
    }

    /// Open a commit window and announce the objects it changes to every
    /// node. Returns the commit serial.
    pub async fn begin_commit(&self, objects: &[ObjectId]) -> Result<Serial> {
        let serial = self.start_commit().await?;
        let args = PrepareArgs {
            node_id: self.manager.node_id()?,
            tx_serial: serial,
            objects: objects.to_vec(),
        };

        if let Err(err) = self
            .manager
            .call_to_all(names::MODIFICATION, names::MODIFICATION_PREPARE, &args)
            .await
        {
            warn!("Prepare of commit {} failed: {}", serial, err);
            if let Err(abort_err) = self.finish_commit(serial, serial, false, objects).await {
                warn!("Abort of commit {} failed: {}", serial, abort_err);
            }
            return Err(err);
        }
        Ok(serial)
    }

    /// Broadcast the outcome of a commit, then close its window
    pub async fn finish_commit(
        &self,
        serial: Serial,
        tx_serial: Serial,
        committed: bool,
        objects: &[ObjectId],
    ) -> Result<()> {
        let outcome = if committed {
            let args = FinalizeArgs {
                tx_serial: serial,
                objects: objects.to_vec(),
            };
            self.manager
                .call_to_all(names::MODIFICATION, names::MODIFICATION_FINALIZE, &args)
                .await
        } else {
            self.manager
                .call_to_all(names::MODIFICATION, names::MODIFICATION_ABORT, &serial)
                .await
        };

        // The window must close even when the broadcast failed
        let ended = self.end_commit(serial, tx_serial).await;
        debug!(
            "Finished commit {} (tx {}, committed: {})",
            serial, tx_serial, committed
        );
        outcome.and(ended)
    }
}

/// Distributed locks on objects and classes
#[derive(Clone)]
pub struct LockTracker {
    manager: Arc<NodeManager>,
}

impl LockTracker {
    pub fn new(manager: Arc<NodeManager>) -> Self {
        Self { manager }
    }

    /// Owner identity for a transaction running on `thread_id` of this node
    pub fn owner(&self, thread_id: u64, tx_serial: Serial) -> Result<LockOwner> {
        Ok(LockOwner::new(self.manager.node_id()?, thread_id, tx_serial))
    }

    /// Send a lock request to the coordinator, along with this node's class
    /// declarations for its targets
    pub async fn lock(&self, request: LockRequest) -> Result<LockGrant> {
        let lineage = self.manager.hierarchy().lineage(&request.targets);
        let request = request.with_lineage(lineage);
        self.manager
            .call_to_coordinator(names::LOCK, names::LOCK_ACQUIRE, &request)
            .await
    }

    /// Exclusive lock. `Ok(false)` when a target went stale, `LockConflict`
    /// when another owner holds it.
    pub async fn lock_exclusive(
        &self,
        owner: LockOwner,
        targets: Vec<LockTarget>,
        wait: impl Into<LockWait>,
    ) -> Result<bool> {
        self.lock(LockRequest::new(owner, targets).with_wait(wait))
            .await?
            .into_result()
    }

    pub async fn lock_shared(
        &self,
        owner: LockOwner,
        targets: Vec<LockTarget>,
        wait: impl Into<LockWait>,
    ) -> Result<bool> {
        self.lock(LockRequest::new(owner, targets).with_wait(wait).read_only())
            .await?
            .into_result()
    }

    /// Exclusive lock that also requires every target to be unchanged
    /// since `serial`
    pub async fn lock_current(
        &self,
        owner: LockOwner,
        targets: Vec<LockTarget>,
        serial: Serial,
        wait: impl Into<LockWait>,
    ) -> Result<bool> {
        self.lock(
            LockRequest::new(owner, targets)
                .with_wait(wait)
                .ensure_current(serial),
        )
        .await?
        .into_result()
    }

    pub async fn lock_object(
        &self,
        owner: LockOwner,
        object: ObjectId,
        wait: impl Into<LockWait>,
    ) -> Result<bool> {
        self.lock_exclusive(owner, vec![LockTarget::Object(object)], wait)
            .await
    }

    pub async fn lock_class(
        &self,
        owner: LockOwner,
        class: ClassId,
        wait: impl Into<LockWait>,
    ) -> Result<bool> {
        self.lock_exclusive(owner, vec![LockTarget::Class(class)], wait)
            .await
    }

    /// Release one level of each target; returns entries fully released
    pub async fn unlock(&self, owner: LockOwner, targets: Vec<LockTarget>) -> Result<usize> {
        self.manager
            .call_to_coordinator(
                names::LOCK,
                names::LOCK_RELEASE,
                &UnlockArgs { owner, targets },
            )
            .await
    }

    /// Release everything the owner holds, e.g. at transaction end
    pub async fn unlock_all(&self, owner: LockOwner) -> Result<usize> {
        self.manager
            .call_to_coordinator(names::LOCK, names::LOCK_RELEASE_ALL, &owner)
            .await
    }
}

/// Local currency answers from this node's modification cache
#[derive(Clone)]
pub struct ModificationTracker {
    cache: Arc<ModificationCache>,
}

impl ModificationTracker {
    pub fn new(cache: Arc<ModificationCache>) -> Self {
        Self { cache }
    }

    pub async fn is_object_current(&self, object: &ObjectId, serial: Serial) -> Result<bool> {
        self.cache.is_object_current(object, serial).await
    }

    /// The class and every subclass unchanged since `serial`
    pub async fn is_class_current(&self, class: &ClassId, serial: Serial) -> Result<bool> {
        self.cache.is_class_current(class, serial).await
    }

    /// Rows of exactly this class unchanged since `serial`
    pub async fn is_table_current(&self, class: &ClassId, serial: Serial) -> Result<bool> {
        self.cache.is_table_current(class, serial).await
    }

    pub async fn is_current(&self, target: &LockTarget, serial: Serial) -> Result<bool> {
        match target {
            LockTarget::Object(object) => self.is_object_current(object, serial).await,
            LockTarget::Class(class) => self.is_class_current(class, serial).await,
        }
    }

    pub fn cache(&self) -> &Arc<ModificationCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_millis() {
        assert_eq!(saturating_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }
}
