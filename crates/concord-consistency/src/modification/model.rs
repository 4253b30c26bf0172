//! Modification cache data model

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use concord_common::{Configuration, NodeId, ObjectId, Serial};

/// Bounds of the in-memory modification window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationConfig {
    pub max_records: usize,
    pub max_age: Duration,
}

impl Default for ModificationConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_age: Duration::from_secs(600),
        }
    }
}

impl ModificationConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            max_records: config.modification_max_records(),
            max_age: Duration::from_millis(config.modification_max_age_ms()),
        }
    }
}

/// A change announced by a committing node but not yet finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Visibility serial of the commit
    pub tx_serial: Serial,
    pub node_id: NodeId,
    /// The committing node or the coordinator went away before the outcome
    /// was broadcast
    pub orphaned: bool,
}

#[derive(Debug, Clone)]
pub struct ModificationRecord {
    pub object: ObjectId,
    /// Last committed change, `None` while only a pending change is known
    pub last_change: Option<Serial>,
    pub pending: Option<PendingChange>,
    pub(crate) touched_at: Instant,
    pub(crate) generation: u64,
}

impl ModificationRecord {
    pub(crate) fn new(object: ObjectId, generation: u64) -> Self {
        Self {
            object,
            last_change: None,
            pending: None,
            touched_at: Instant::now(),
            generation,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_orphaned(&self) -> bool {
        self.pending.is_some_and(|p| p.orphaned)
    }

    /// Record the committed change of commit `tx_serial`, keeping the
    /// highest change serial. A pending change of another commit survives.
    pub(crate) fn commit(&mut self, tx_serial: Serial, change: Serial) {
        self.last_change = Some(self.last_change.map_or(change, |l| l.max(change)));
        if self.pending.is_some_and(|p| p.tx_serial == tx_serial) {
            self.pending = None;
        }
    }
}
