//! Sync engine for Orchard.
//!
//! A pool of worker tasks claims actions from the durable queue, invokes the
//! remote adapter, and applies results atomically to the state store and
//! cache. IO workers handle transfers; a dedicated metadata worker keeps
//! short latency-sensitive operations (listings, renames, reconciles) off
//! the transfer path.

mod connectivity;
mod engine;
mod handlers;

pub use connectivity::Connectivity;
pub use engine::{EngineConfig, SyncEngine};

use thiserror::Error;

use orchard_cache::CacheError;
use orchard_core::domain::DomainError;
use orchard_core::ports::remote::RemoteError;
use orchard_store::StoreError;

/// Errors flowing out of action handlers, classified by the worker loop.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The action's target or a prerequisite is not ready yet; retry later.
    #[error("not ready: {0}")]
    NotReady(String),
}
