//! Metric descriptions for the node runner
//!
//! The library crates record these through the `metrics` facade.

use metrics::{describe_counter, describe_gauge};

/// Describe every metric the node records. Call once at startup.
pub fn init_metrics() {
    // Serials and commit fencing
    describe_counter!("concord_serials_issued_total", "Serials issued by this coordinator");
    describe_counter!(
        "concord_commit_windows_opened_total",
        "Commit windows opened"
    );
    describe_counter!(
        "concord_commit_windows_closed_total",
        "Commit windows closed"
    );
    describe_gauge!("concord_commit_windows_open", "Commit windows currently open");

    // Locks
    describe_counter!("concord_lock_grants_total", "Lock calls granted");
    describe_counter!(
        "concord_lock_conflicts_total",
        "Lock calls denied by a conflicting holder"
    );
    describe_counter!(
        "concord_lock_timeouts_total",
        "Lock calls that ran out of wait budget"
    );
    describe_counter!(
        "concord_lock_stale_total",
        "Lock calls refused because a target changed"
    );
    describe_gauge!("concord_lock_entries", "Lock entries currently held");

    // Modification tracking
    describe_counter!(
        "concord_modification_evictions_total",
        "Modification records evicted"
    );
    describe_gauge!(
        "concord_modification_records",
        "Modification records in memory"
    );

    // Membership
    describe_gauge!(
        "concord_cluster_participants",
        "Participants connected to this coordinator"
    );
    describe_counter!("concord_elections_won_total", "Times this node became coordinator");
    describe_counter!(
        "concord_coordinator_losses_total",
        "Times this node lost its coordinator link"
    );
}
