//! Node-to-node transport
//!
//! - `codec`: length-delimited JSON envelopes
//! - `endpoint`: one connection with request/response correlation
//! - `pool`: demand-grown workers for inbound calls

pub mod codec;
pub mod endpoint;
pub mod pool;

pub use codec::{Envelope, MAX_FRAME_LEN, RequestId, read_frame, write_frame};
pub use endpoint::{Endpoint, EndpointConfig, LossCallback, RemoteOutcome};
pub use pool::{WorkerPool, WorkerPoolConfig};
