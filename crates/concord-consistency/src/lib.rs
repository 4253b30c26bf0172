//! Concord Consistency - Coordinator-side ordering and locking state
//!
//! This crate provides:
//! - Serial generator (globally ordered, gap-tolerant sequence)
//! - Commit fence (open commit windows and query barriers)
//! - Class hierarchy closure table
//! - Distributed lock registry (exclusive/shared, re-entrant, hierarchical)
//! - Modification cache (object and class currency)
//!
//! Every state object here is single-owner: it is created when a node
//! becomes coordinator (or starts, for the modification cache), passed by
//! handle, and torn down explicitly.

pub mod fence;
pub mod lock;
pub mod modification;
pub mod serial;

pub use fence::{CommitFence, CommitWindow};
pub use lock::{
    ClassHierarchy, CurrencyCheck, LockEntry, LockGrant, LockOwner, LockRegistry, LockRequest,
    LockStats, LockWait,
};
pub use modification::{ModificationCache, ModificationConfig, ModificationRecord, PendingChange};
pub use serial::{Clock, ManualClock, SerialGenerator, SystemClock};
