//! On-disk content cache for Orchard.
//!
//! Files are addressed by object ID under the cache root. Small files are
//! materialized whole (`.part` + atomic rename); large files are sparse —
//! allocated to their logical size up front, with 8 MiB chunks written at
//! aligned offsets as they arrive and reclaimed later by hole punching.
//!
//! Cache files are mutated only through this crate; the sync engine and the
//! FUSE surface call through [`CacheStore`]. Presence bookkeeping (which
//! chunks exist, full/sparse/absent) lives in `orchard-store`; the bytes
//! live here.

mod content;
mod eviction;
mod waiters;

pub use content::{CacheStore, StagedUpload};
pub use eviction::{EvictionSummary, Evictor};
pub use waiters::ChunkWaiters;

use thiserror::Error;

/// Errors raised by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Underlying filesystem error.
    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The disk is full; the caller should trigger an eviction pass.
    #[error("Cache device out of space")]
    NoSpace,

    /// Presence bookkeeping failed.
    #[error(transparent)]
    Store(#[from] orchard_store::StoreError),
}

impl CacheError {
    /// Classify an I/O error, mapping `ENOSPC` to [`CacheError::NoSpace`].
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            CacheError::NoSpace
        } else {
            CacheError::Io(err)
        }
    }
}
