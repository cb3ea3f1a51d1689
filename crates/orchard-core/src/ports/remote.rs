//! Remote adapter port (driven/secondary port).
//!
//! The engine consumes exactly this capability set; any implementation that
//! honors the contract can drive it — the production iCloud client, or the
//! in-memory adapter in `orchard-remote` used by tests. Every mutation
//! returns fresh versioning tokens that the engine must echo back as
//! `if_match` on the next conditional call.
//!
//! ## Design Notes
//!
//! - Error classification is part of the contract: `PreconditionFailed`
//!   drives the conflict protocol and `NotFound` drives tombstoning, so
//!   they are typed variants rather than adapter-specific strings.
//! - `download_range` is inclusive on both ends, shaped like an HTTP
//!   `Range` header.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::newtypes::{CloudId, Etag, Revision};
use crate::domain::object::ObjectKind;

/// Errors surfaced by remote adapter operations.
///
/// The sync engine's retry/conflict/tombstone decisions key off these
/// variants; see the error taxonomy in the engine crate.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The target does not exist on the remote.
    #[error("remote object not found")]
    NotFound,

    /// An `if_match` token did not match the remote's current version.
    #[error("remote precondition failed")]
    PreconditionFailed,

    /// The content has not changed relative to the supplied token.
    #[error("remote content not modified")]
    NotModified,

    /// Authentication is missing or expired; the engine pauses rather
    /// than burning retries.
    #[error("remote authentication failed: {0}")]
    Auth(String),

    /// Timeout, connection reset, 5xx, 429 — retried with backoff.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Anything else; fatal for the action.
    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// True for failures worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChild {
    pub cloud_id: CloudId,
    /// Full name including extension.
    pub name: String,
    pub kind: ObjectKind,
    pub size: u64,
    pub etag: Etag,
    pub modified_at: DateTime<Utc>,
}

/// Metadata for a single remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub etag: Etag,
    pub revision: Revision,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
}

/// Tokens returned by rename/move mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationReceipt {
    pub etag: Etag,
    pub revision: Revision,
}

/// Identity and tokens returned by an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub cloud_id: CloudId,
    pub etag: Etag,
    pub revision: Revision,
}

/// Capability set the sync engine requires from the remote store.
///
/// All calls have bounded timeouts inside the implementation. The engine
/// never performs these calls inside a state-store transaction.
#[async_trait::async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Single-level listing of a remote folder.
    async fn list(&self, folder_cloud_id: &CloudId) -> Result<Vec<RemoteChild>, RemoteError>;

    /// Metadata for one remote object.
    async fn metadata(&self, cloud_id: &CloudId) -> Result<RemoteMetadata, RemoteError>;

    /// Inclusive byte range `[start, end]` of a remote file.
    async fn download_range(
        &self,
        cloud_id: &CloudId,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, RemoteError>;

    /// Create or replace a file under `parent_cloud_id` with the given name.
    ///
    /// `content` is the staged local bytes (presented under the intended
    /// remote name by the cache layer). When `if_match` is set the upload is
    /// conditional on the current remote version.
    async fn upload(
        &self,
        parent_cloud_id: &CloudId,
        name: &str,
        content: Vec<u8>,
        if_match: Option<&Etag>,
    ) -> Result<UploadResult, RemoteError>;

    /// Create a remote folder.
    async fn create_folder(
        &self,
        parent_cloud_id: &CloudId,
        name: &str,
    ) -> Result<UploadResult, RemoteError>;

    /// Conditional rename within the same parent.
    async fn rename(
        &self,
        cloud_id: &CloudId,
        new_name: &str,
        if_match: &Etag,
    ) -> Result<MutationReceipt, RemoteError>;

    /// Conditional reparenting, keeping the name.
    async fn move_to(
        &self,
        cloud_id: &CloudId,
        new_parent_cloud_id: &CloudId,
        if_match: &Etag,
    ) -> Result<MutationReceipt, RemoteError>;

    /// Conditional delete. `NotFound` is reported as such; callers treat
    /// "already gone" as success.
    async fn delete(&self, cloud_id: &CloudId, if_match: Option<&Etag>)
        -> Result<(), RemoteError>;
}
