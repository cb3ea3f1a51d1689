//! Remote adapter implementations.
//!
//! The engine is generic over [`orchard_core::ports::RemoteAdapter`]; this
//! crate provides the in-memory implementation used by property tests, the
//! end-to-end suite, and the daemon's development driver. The production
//! iCloud HTTP client lives outside this repository and plugs into the same
//! trait.

mod memory;

pub use memory::{CallCounts, MemoryRemote};
