//! Shadow snapshots — the baseline for three-way conflict detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{CloudId, Etag, FileHash, ObjectId};

/// Last-observed remote metadata for one object.
///
/// Written in the same transaction as every successful remote mutation and
/// whenever an incoming remote change is applied; never written on failure.
/// Exactly one shadow exists per synced object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shadow {
    pub object_id: ObjectId,
    pub cloud_id: CloudId,
    /// Remote parent at snapshot time, when known.
    pub parent_cloud_id: Option<CloudId>,
    /// Full remote name at snapshot time.
    pub name: String,
    pub etag: Etag,
    pub file_hash: Option<FileHash>,
    pub modified_at: DateTime<Utc>,
    /// When this snapshot was taken.
    pub observed_at: DateTime<Utc>,
}

impl Shadow {
    /// Snapshot taken now from freshly observed remote state.
    #[must_use]
    pub fn observe(
        object_id: ObjectId,
        cloud_id: CloudId,
        parent_cloud_id: Option<CloudId>,
        name: impl Into<String>,
        etag: Etag,
        file_hash: Option<FileHash>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            object_id,
            cloud_id,
            parent_cloud_id,
            name: name.into(),
            etag,
            file_hash,
            modified_at,
            observed_at: Utc::now(),
        }
    }

    /// True when the given remote state differs from this baseline.
    ///
    /// "Changed" means the content hash or relevant metadata (ETag, name)
    /// differs from the snapshot.
    #[must_use]
    pub fn remote_changed(&self, etag: &Etag, file_hash: Option<&FileHash>, name: &str) -> bool {
        if &self.etag != etag {
            return true;
        }
        if self.name != name {
            return true;
        }
        match (&self.file_hash, file_hash) {
            (Some(a), Some(b)) => a != b,
            (None, None) => false,
            _ => true,
        }
    }
}
