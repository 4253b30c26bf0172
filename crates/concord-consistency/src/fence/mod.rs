//! Commit fence
//!
//! Tracks open commit windows on the coordinator. A window opens when a
//! commit picks its visibility serial and closes once the physical commit
//! (or rollback) is done. Queries at serial S wait until no window at or
//! below S remains open.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use concord_common::{ConcordError, NodeId, Result, Serial, current_timestamp};

use crate::serial::SerialGenerator;

/// An open commit window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitWindow {
    pub serial: Serial,
    pub node_id: NodeId,
    /// Unix millis when the window opened
    pub opened_at: i64,
}

pub struct CommitFence {
    serials: Arc<SerialGenerator>,
    windows: Mutex<BTreeMap<Serial, CommitWindow>>,
    released: Notify,
}

impl CommitFence {
    pub fn new(serials: Arc<SerialGenerator>) -> Self {
        Self {
            serials,
            windows: Mutex::new(BTreeMap::new()),
            released: Notify::new(),
        }
    }

    /// Allocate a visibility serial for a commit and open its window.
    ///
    /// The serial is issued while the window table is locked, so any query
    /// serial issued afterwards is guaranteed to see this window.
    pub fn start_commit(&self, node_id: NodeId) -> Result<Serial> {
        let mut windows = self.windows.lock();
        let serial = self.serials.next_serial()?;
        windows.insert(
            serial,
            CommitWindow {
                serial,
                node_id,
                opened_at: current_timestamp(),
            },
        );

        metrics::counter!("concord_commit_windows_opened_total").increment(1);
        metrics::gauge!("concord_commit_windows_open").set(windows.len() as f64);
        debug!("Opened commit window {} for node {}", serial, node_id);
        Ok(serial)
    }

    /// Close a commit window and wake every waiting query
    pub fn end_commit(&self, node_id: NodeId, serial: Serial, tx_serial: Serial) -> Result<()> {
        let mut windows = self.windows.lock();
        match windows.get(&serial) {
            Some(window) if window.node_id != node_id => {
                return Err(ConcordError::IllegalState(format!(
                    "commit window {} belongs to node {}, not {}",
                    serial, window.node_id, node_id
                )));
            }
            Some(_) => {
                windows.remove(&serial);
            }
            None => {
                warn!(
                    "Commit window {} (tx {}) of node {} already closed",
                    serial, tx_serial, node_id
                );
            }
        }

        metrics::counter!("concord_commit_windows_closed_total").increment(1);
        metrics::gauge!("concord_commit_windows_open").set(windows.len() as f64);
        drop(windows);

        debug!(
            "Closed commit window {} (tx {}) for node {}",
            serial, tx_serial, node_id
        );
        self.released.notify_waiters();
        Ok(())
    }

    /// Block until no commit window at or below `serial` is open.
    ///
    /// `timeout` of `None` waits indefinitely.
    pub async fn wait_for_query(&self, serial: Serial, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.has_open_window_at_or_below(serial) {
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut())
                        .await
                        .is_err()
                        && self.has_open_window_at_or_below(serial)
                    {
                        return Err(ConcordError::Timeout(format!(
                            "commits at or below {} still open",
                            serial
                        )));
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Force-close every window owned by a departed node
    pub fn release_node(&self, node_id: NodeId) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| window.node_id != node_id);
        let removed = before - windows.len();
        metrics::gauge!("concord_commit_windows_open").set(windows.len() as f64);
        drop(windows);

        if removed > 0 {
            info!(
                "Released {} commit windows of departed node {}",
                removed, node_id
            );
            self.released.notify_waiters();
        }
        removed
    }

    pub fn has_open_window_at_or_below(&self, serial: Serial) -> bool {
        self.windows.lock().range(..=serial).next().is_some()
    }

    /// Snapshot of every open window, ordered by serial
    pub fn open_windows(&self) -> Vec<CommitWindow> {
        self.windows.lock().values().cloned().collect()
    }

    pub fn serials(&self) -> &Arc<SerialGenerator> {
        &self.serials
    }
}
