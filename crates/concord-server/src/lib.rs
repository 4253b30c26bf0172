//! Concord Server - the `concord-node` runner
//!
//! Loads configuration, sets up logging, starts one cluster node, and keeps
//! it in the group until the process is told to stop.

pub mod cli;
pub mod metrics;
pub mod startup;
