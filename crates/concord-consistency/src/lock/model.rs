//! Lock data model

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use concord_common::{ConcordError, LockTarget, NodeId, Result, Serial, current_timestamp};

use super::hierarchy::ClassDeclaration;

/// Identity of a lock holder: one transaction on one thread of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub node_id: NodeId,
    pub thread_id: u64,
    pub tx_serial: Serial,
}

impl LockOwner {
    pub fn new(node_id: NodeId, thread_id: u64, tx_serial: Serial) -> Self {
        Self {
            node_id,
            thread_id,
            tx_serial,
        }
    }
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "node {} thread {} tx {}",
            self.node_id, self.thread_id, self.tx_serial
        )
    }
}

/// One granted lock on one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub target: LockTarget,
    pub owner: LockOwner,
    /// Re-entry depth, always at least 1 while the entry exists
    pub depth: u32,
    pub read_only: bool,
    /// Opaque caller metadata, surfaced to conflicting callers
    #[serde(default)]
    pub session_info: Option<String>,
    /// Unix millis of the first grant
    pub acquired_at: i64,
}

impl LockEntry {
    pub fn new(
        target: LockTarget,
        owner: LockOwner,
        read_only: bool,
        session_info: Option<String>,
    ) -> Self {
        Self {
            target,
            owner,
            depth: 1,
            read_only,
            session_info,
            acquired_at: current_timestamp(),
        }
    }

    /// Whether a request by `owner` conflicts with this entry.
    ///
    /// Entries of the same owner never conflict; two read-only sides never
    /// conflict.
    pub fn conflicts_with(&self, owner: &LockOwner, read_only: bool) -> bool {
        self.owner != *owner && !(self.read_only && read_only)
    }
}

/// How long a lock call may block on conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockWait {
    /// Fail immediately on the first conflict
    NoWait,
    /// Block until granted
    #[default]
    Forever,
    /// One budget shared by every target of the call
    Timeout(Duration),
}

impl From<i64> for LockWait {
    /// Millisecond convention: negative fails fast, zero waits forever,
    /// positive is a budget.
    fn from(wait_ms: i64) -> Self {
        match wait_ms {
            ms if ms < 0 => LockWait::NoWait,
            0 => LockWait::Forever,
            ms => LockWait::Timeout(Duration::from_millis(ms as u64)),
        }
    }
}

/// A multi-target lock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub owner: LockOwner,
    pub targets: Vec<LockTarget>,
    #[serde(default)]
    pub session_info: Option<String>,
    #[serde(default)]
    pub wait: LockWait,
    /// When set, every target must still be current as of this serial
    #[serde(default)]
    pub ensure_current: Option<Serial>,
    #[serde(default)]
    pub read_only: bool,
    /// The caller's class declarations for the targets
    #[serde(default)]
    pub lineage: Vec<ClassDeclaration>,
}

impl LockRequest {
    pub fn new(owner: LockOwner, targets: Vec<LockTarget>) -> Self {
        Self {
            owner,
            targets,
            session_info: None,
            wait: LockWait::Forever,
            ensure_current: None,
            read_only: false,
            lineage: Vec::new(),
        }
    }

    pub fn single(owner: LockOwner, target: LockTarget) -> Self {
        Self::new(owner, vec![target])
    }

    pub fn with_session_info(mut self, session_info: impl Into<String>) -> Self {
        self.session_info = Some(session_info.into());
        self
    }

    pub fn with_wait(mut self, wait: impl Into<LockWait>) -> Self {
        self.wait = wait.into();
        self
    }

    pub fn ensure_current(mut self, serial: Serial) -> Self {
        self.ensure_current = Some(serial);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_lineage(mut self, lineage: Vec<ClassDeclaration>) -> Self {
        self.lineage = lineage;
        self
    }

    /// Targets in acquisition order, each listed once
    pub fn canonical_targets(&self) -> Vec<LockTarget> {
        let mut targets = self.targets.clone();
        targets.sort();
        targets.dedup();
        targets
    }
}

/// Outcome of a lock call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LockGrant {
    Granted,
    /// Another owner holds a conflicting entry
    Conflict {
        session_info: Option<String>,
        owner: LockOwner,
        targets: Vec<LockTarget>,
    },
    /// A target changed after the caller's snapshot; nothing was granted
    Stale,
}

impl LockGrant {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockGrant::Granted)
    }

    /// `Ok(true)` when granted, `Ok(false)` when stale, `LockConflict` otherwise
    pub fn into_result(self) -> Result<bool> {
        match self {
            LockGrant::Granted => Ok(true),
            LockGrant::Stale => Ok(false),
            LockGrant::Conflict {
                session_info,
                targets,
                ..
            } => Err(ConcordError::LockConflict {
                session_info,
                targets,
            }),
        }
    }
}

/// Lock table statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Entries currently held
    pub entries: usize,
    /// Distinct targets currently locked
    pub targets: usize,
    /// Calls currently blocked on a conflict
    pub waiters: usize,
    pub total_grants: u64,
    pub total_conflicts: u64,
    pub total_timeouts: u64,
    pub total_stale: u64,
    pub total_releases: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_from_millis() {
        assert_eq!(LockWait::from(-1), LockWait::NoWait);
        assert_eq!(LockWait::from(0), LockWait::Forever);
        assert_eq!(
            LockWait::from(250),
            LockWait::Timeout(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_conflict_rules() {
        let a = LockOwner::new(1, 1, Serial(10));
        let b = LockOwner::new(2, 1, Serial(11));
        let shared = LockEntry::new(LockTarget::object("Order", 1), a, true, None);
        let exclusive = LockEntry::new(LockTarget::object("Order", 1), a, false, None);

        assert!(!shared.conflicts_with(&b, true));
        assert!(shared.conflicts_with(&b, false));
        assert!(exclusive.conflicts_with(&b, true));
        assert!(!exclusive.conflicts_with(&a, false));
    }

    #[test]
    fn test_canonical_targets() {
        let request = LockRequest::new(
            LockOwner::new(1, 1, Serial(10)),
            vec![
                LockTarget::object("Order", 2),
                LockTarget::class("Order"),
                LockTarget::object("Order", 2),
            ],
        );
        assert_eq!(
            request.canonical_targets(),
            vec![LockTarget::class("Order"), LockTarget::object("Order", 2)]
        );
    }

    #[test]
    fn test_grant_into_result() {
        assert!(LockGrant::Granted.into_result().unwrap());
        assert!(!LockGrant::Stale.into_result().unwrap());

        let conflict = LockGrant::Conflict {
            session_info: Some("batch-import".to_string()),
            owner: LockOwner::new(3, 9, Serial(1)),
            targets: vec![LockTarget::class("Order")],
        };
        match conflict.into_result() {
            Err(ConcordError::LockConflict { session_info, .. }) => {
                assert_eq!(session_info.as_deref(), Some("batch-import"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
