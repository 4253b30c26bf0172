//! Modification tracking
//!
//! Each node keeps a bounded window of recent object changes so currency
//! questions can be answered without a storage round trip.

mod cache;
mod model;

pub use cache::*;
pub use model::*;
