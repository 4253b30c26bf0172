//! Application startup: logging, storage backends, the node run loop, and
//! graceful shutdown.

mod logging;
mod node;
mod shutdown;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use node::{Backends, connect_backends, run_node, spawn_eviction};
pub use shutdown::{ShutdownSignal, run_with_shutdown, wait_for_shutdown_signal};
