//! Object entity and the sync-state machine.
//!
//! An [`Object`] is one node of the projected tree — a file or a folder —
//! reconciling three representations: the remote store, the local database
//! row, and the projected filesystem. Its [`SyncState`] is an explicit
//! tagged state machine; invalid transitions are rejected here rather than
//! checked ad hoc at every call site.
//!
//! ```text
//!              local write                upload ok
//!   ┌────────┐ ──────────► ┌───────┐ ─────────────► ┌────────┐
//!   │ Synced │             │ Dirty │                │ Synced │
//!   └────────┘ ◄────────── └───────┘ ──┐            └────────┘
//!        │       pull ok        │      │ etag mismatch
//!        │ remote change        │      ▼
//!        ▼                      │  ┌──────────┐
//!   ┌─────────────┐             └─►│ Conflict │
//!   │ PendingPull │                └──────────┘
//!   └─────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{CloudId, Etag, FileHash, ObjectId, Revision};

/// Whether an object is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    File,
    Folder,
}

impl ObjectKind {
    /// Stored string form (`file` / `folder`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::File => "file",
            ObjectKind::Folder => "folder",
        }
    }
}

/// Which side first created the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Created through the FUSE surface; `cloud_id` is null until pushed.
    Local,
    /// Discovered in a remote listing; `cloud_id` is set at creation.
    Cloud,
}

impl Origin {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Cloud => "cloud",
        }
    }
}

// ============================================================================
// SyncState
// ============================================================================

/// Synchronization state of an object.
///
/// The two deletion directions are first-class variants: `DeletedLocal`
/// (user removed the projection, remote delete pending) and `DeletedCloud`
/// (remote removed it, local teardown pending). Both imply `deleted = 1` on
/// the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local and remote agree; `dirty = 0` and the ETag matches the shadow.
    #[default]
    Synced,
    /// Local content changed; a coalesced content push is queued.
    Dirty,
    /// A locally created object awaiting its first upload.
    PendingPush,
    /// A remote change awaiting local application.
    PendingPull,
    /// Both sides changed and the engine declined to auto-resolve.
    Conflict,
    /// A fatal per-object failure; surfaced, never silently dropped.
    Error(String),
    /// Deleted through the FUSE surface; remote delete pending.
    DeletedLocal,
    /// Deleted on the remote; local projection teardown pending.
    DeletedCloud,
}

impl SyncState {
    /// State name without error details, as stored and exposed via xattrs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Dirty => "dirty",
            SyncState::PendingPush => "pending_push",
            SyncState::PendingPull => "pending_pull",
            SyncState::Conflict => "conflict",
            SyncState::Error(_) => "error",
            SyncState::DeletedLocal => "deleted_local",
            SyncState::DeletedCloud => "deleted_cloud",
        }
    }

    /// True if the object carries local intent not yet on the remote.
    #[must_use]
    pub fn has_pending_push(&self) -> bool {
        matches!(
            self,
            SyncState::Dirty | SyncState::PendingPush | SyncState::DeletedLocal
        )
    }

    /// True if the object needs user attention.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(self, SyncState::Conflict | SyncState::Error(_))
    }

    /// True if either side has deleted the object.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        matches!(self, SyncState::DeletedLocal | SyncState::DeletedCloud)
    }

    /// Whether the machine permits moving from `self` to `target`.
    ///
    /// `Error` may retry into any state. The deletion states admit only the
    /// conflict-protocol escapes — `DeletedCloud → PendingPush` (delete-vs-edit
    /// undelete) and `DeletedLocal → PendingPull` (edit-vs-delete restore) —
    /// plus `Conflict` and `Error`.
    #[must_use]
    pub fn can_transition_to(&self, target: &SyncState) -> bool {
        if matches!(self, SyncState::Error(_)) {
            return true;
        }
        // Self-transitions are idempotent no-ops.
        if self.name() == target.name() {
            return true;
        }

        match (self, target) {
            (SyncState::Synced, SyncState::Dirty)
            | (SyncState::Synced, SyncState::PendingPush)
            | (SyncState::Synced, SyncState::PendingPull)
            | (SyncState::Synced, SyncState::DeletedLocal)
            | (SyncState::Synced, SyncState::DeletedCloud)
            | (SyncState::Synced, SyncState::Error(_)) => true,

            (SyncState::Dirty, SyncState::Synced)
            | (SyncState::Dirty, SyncState::PendingPush)
            | (SyncState::Dirty, SyncState::Conflict)
            | (SyncState::Dirty, SyncState::DeletedLocal)
            | (SyncState::Dirty, SyncState::DeletedCloud)
            | (SyncState::Dirty, SyncState::Error(_)) => true,

            (SyncState::PendingPush, SyncState::Synced)
            | (SyncState::PendingPush, SyncState::Dirty)
            | (SyncState::PendingPush, SyncState::Conflict)
            | (SyncState::PendingPush, SyncState::DeletedLocal)
            | (SyncState::PendingPush, SyncState::Error(_)) => true,

            (SyncState::PendingPull, SyncState::Synced)
            | (SyncState::PendingPull, SyncState::Dirty)
            | (SyncState::PendingPull, SyncState::Conflict)
            | (SyncState::PendingPull, SyncState::DeletedCloud)
            | (SyncState::PendingPull, SyncState::Error(_)) => true,

            (SyncState::Conflict, SyncState::Synced)
            | (SyncState::Conflict, SyncState::PendingPush)
            | (SyncState::Conflict, SyncState::PendingPull)
            | (SyncState::Conflict, SyncState::DeletedLocal)
            | (SyncState::Conflict, SyncState::Error(_)) => true,

            (SyncState::DeletedLocal, SyncState::PendingPull)
            | (SyncState::DeletedLocal, SyncState::Conflict)
            | (SyncState::DeletedLocal, SyncState::Error(_)) => true,

            (SyncState::DeletedCloud, SyncState::PendingPush)
            | (SyncState::DeletedCloud, SyncState::Conflict)
            | (SyncState::DeletedCloud, SyncState::Error(_)) => true,

            _ => false,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Error(reason) => write!(f, "error: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

// ============================================================================
// Object
// ============================================================================

/// A file or folder in the projected tree.
///
/// Identity is the locally minted [`ObjectId`]; the [`CloudId`] binds it to
/// the remote and stays null until the first successful push. Uniqueness of
/// `(parent_id, name, extension)` among non-deleted siblings is enforced by
/// the state store, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Stable local identity.
    pub id: ObjectId,
    /// Remote binding; `None` until first sync.
    pub cloud_id: Option<CloudId>,
    pub kind: ObjectKind,
    /// `None` only for the root object.
    pub parent_id: Option<ObjectId>,
    /// Name without extension.
    pub name: String,
    /// Extension without the leading dot; `None` for folders and bare names.
    pub extension: Option<String>,
    /// Logical size in bytes; 0 for folders.
    pub size: u64,
    pub local_modified_at: DateTime<Utc>,
    pub cloud_modified_at: Option<DateTime<Utc>>,
    /// Last remote versioning token observed for this object.
    pub etag: Option<Etag>,
    pub revision: Option<Revision>,
    pub origin: Origin,
    pub sync_state: SyncState,
    pub dirty: bool,
    pub deleted: bool,
    /// Set when a push found the object gone on the remote.
    pub missing_from_cloud: bool,
    pub last_synced: Option<DateTime<Utc>>,
    /// Local content hash, when known.
    pub content_hash: Option<FileHash>,
    /// Audit notes for displaced remote versions (JSON array, persisted).
    pub conflict_history: Option<String>,
}

impl Object {
    /// Split a full filename into `(name, extension)`.
    ///
    /// The extension is everything after the last dot, unless the dot is the
    /// first character (dotfiles keep their full name).
    #[must_use]
    pub fn split_name(full: &str) -> (String, Option<String>) {
        match full.rfind('.') {
            Some(idx) if idx > 0 => (
                full[..idx].to_string(),
                Some(full[idx + 1..].to_string()),
            ),
            _ => (full.to_string(), None),
        }
    }

    /// Reassemble the full filename from `name` and `extension`.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}", self.name, ext),
            None => self.name.clone(),
        }
    }

    /// Validate a full filename for use in the tree.
    pub fn validate_name(full: &str) -> Result<(), DomainError> {
        if full.is_empty() || full == "." || full == ".." {
            return Err(DomainError::InvalidName(full.to_string()));
        }
        if full.contains('/') || full.contains('\0') {
            return Err(DomainError::InvalidName(full.to_string()));
        }
        if full.len() > 255 {
            return Err(DomainError::InvalidName(format!("{}…", &full[..32])));
        }
        Ok(())
    }

    /// A locally created object, as produced by FUSE `create`/`mkdir`.
    pub fn new_local(
        parent_id: ObjectId,
        full_name: &str,
        kind: ObjectKind,
    ) -> Result<Self, DomainError> {
        Self::validate_name(full_name)?;
        let (name, extension) = Self::split_name(full_name);
        Ok(Self {
            id: ObjectId::new(),
            cloud_id: None,
            kind,
            parent_id: Some(parent_id),
            name,
            extension,
            size: 0,
            local_modified_at: Utc::now(),
            cloud_modified_at: None,
            etag: None,
            revision: None,
            origin: Origin::Local,
            sync_state: SyncState::PendingPush,
            dirty: false,
            deleted: false,
            missing_from_cloud: false,
            last_synced: None,
            content_hash: None,
            conflict_history: None,
        })
    }

    /// A cloud-originated object, as produced by a `list_children` pull.
    ///
    /// Born `Synced` with its shadow written by the caller in the same
    /// transaction; no cache entry exists yet.
    pub fn new_from_cloud(
        parent_id: ObjectId,
        full_name: &str,
        kind: ObjectKind,
        cloud_id: CloudId,
        size: u64,
        etag: Etag,
        cloud_modified_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        Self::validate_name(full_name)?;
        let (name, extension) = Self::split_name(full_name);
        Ok(Self {
            id: ObjectId::new(),
            cloud_id: Some(cloud_id),
            kind,
            parent_id: Some(parent_id),
            name,
            extension,
            size,
            local_modified_at: cloud_modified_at,
            cloud_modified_at: Some(cloud_modified_at),
            etag: Some(etag),
            revision: None,
            origin: Origin::Cloud,
            sync_state: SyncState::Synced,
            dirty: false,
            deleted: false,
            missing_from_cloud: false,
            last_synced: Some(Utc::now()),
            content_hash: None,
            conflict_history: None,
        })
    }

    /// The root folder. Never deleted, `parent_id = None`.
    #[must_use]
    pub fn root(cloud_id: Option<CloudId>) -> Self {
        Self {
            id: ObjectId::new(),
            cloud_id,
            kind: ObjectKind::Folder,
            parent_id: None,
            name: String::new(),
            extension: None,
            size: 0,
            local_modified_at: Utc::now(),
            cloud_modified_at: None,
            etag: None,
            revision: None,
            origin: Origin::Cloud,
            sync_state: SyncState::Synced,
            dirty: false,
            deleted: false,
            missing_from_cloud: false,
            last_synced: None,
            content_hash: None,
            conflict_history: None,
        }
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, ObjectKind::Folder)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Attempt a sync-state transition, keeping the flag fields coherent.
    ///
    /// Entering `Synced` clears `dirty` and stamps `last_synced`; entering
    /// either deletion state sets `deleted`.
    pub fn transition_to(&mut self, target: SyncState) -> Result<(), DomainError> {
        if !self.sync_state.can_transition_to(&target) {
            return Err(DomainError::InvalidTransition {
                from: self.sync_state.name().to_string(),
                to: target.name().to_string(),
            });
        }
        match &target {
            SyncState::Synced => {
                self.dirty = false;
                self.last_synced = Some(Utc::now());
            }
            SyncState::Dirty => {
                self.dirty = true;
            }
            SyncState::DeletedLocal | SyncState::DeletedCloud => {
                self.deleted = true;
            }
            SyncState::PendingPull if self.deleted => {
                // Edit-vs-delete restore cancels the local delete.
                self.deleted = false;
            }
            _ => {}
        }
        self.sync_state = target;
        Ok(())
    }

    /// Mark the object dirty after a local content write. Idempotent.
    pub fn mark_dirty(&mut self) -> Result<(), DomainError> {
        self.local_modified_at = Utc::now();
        if matches!(self.sync_state, SyncState::Dirty) {
            return Ok(());
        }
        // A fresh local create stays PendingPush; its first upload carries
        // whatever content is in the cache at claim time.
        if matches!(self.sync_state, SyncState::PendingPush) {
            self.dirty = true;
            return Ok(());
        }
        self.transition_to(SyncState::Dirty)
    }

    /// Record a successful push: bind the remote identity, refresh the
    /// versioning tokens, and settle into `Synced`.
    pub fn apply_push_result(
        &mut self,
        cloud_id: CloudId,
        etag: Etag,
        revision: Revision,
    ) -> Result<(), DomainError> {
        self.transition_to(SyncState::Synced)?;
        self.cloud_id = Some(cloud_id);
        self.etag = Some(etag);
        self.revision = Some(revision);
        self.missing_from_cloud = false;
        Ok(())
    }

    /// Append a displaced remote version to the persisted conflict history.
    pub fn record_displaced_remote(&mut self, displaced_cloud_id: &CloudId, etag: &Etag) {
        let mut notes: Vec<serde_json::Value> = self
            .conflict_history
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        notes.push(serde_json::json!({
            "displaced_cloud_id": displaced_cloud_id.as_str(),
            "displaced_etag": etag.as_str(),
            "at": Utc::now().to_rfc3339(),
        }));
        self.conflict_history = serde_json::to_string(&notes).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_file() -> Object {
        Object::new_local(ObjectId::new(), "report.pdf", ObjectKind::File).unwrap()
    }

    mod name_tests {
        use super::*;

        #[test]
        fn test_split_name() {
            assert_eq!(
                Object::split_name("movie.mp4"),
                ("movie".to_string(), Some("mp4".to_string()))
            );
            assert_eq!(Object::split_name("Makefile"), ("Makefile".to_string(), None));
            assert_eq!(Object::split_name(".bashrc"), (".bashrc".to_string(), None));
            assert_eq!(
                Object::split_name("archive.tar.gz"),
                ("archive.tar".to_string(), Some("gz".to_string()))
            );
        }

        #[test]
        fn test_full_name_roundtrip() {
            let obj = local_file();
            assert_eq!(obj.full_name(), "report.pdf");
        }

        #[test]
        fn test_validate_name_rejections() {
            assert!(Object::validate_name("").is_err());
            assert!(Object::validate_name(".").is_err());
            assert!(Object::validate_name("..").is_err());
            assert!(Object::validate_name("a/b").is_err());
            assert!(Object::validate_name(&"x".repeat(256)).is_err());
            assert!(Object::validate_name("ok.txt").is_ok());
        }
    }

    mod state_machine_tests {
        use super::*;

        #[test]
        fn test_local_create_starts_pending_push() {
            let obj = local_file();
            assert_eq!(obj.sync_state, SyncState::PendingPush);
            assert_eq!(obj.origin, Origin::Local);
            assert!(obj.cloud_id.is_none());
        }

        #[test]
        fn test_synced_to_dirty_and_back() {
            let mut obj = local_file();
            let cid = CloudId::new("c1").unwrap();
            obj.apply_push_result(
                cid,
                Etag::new("e1").unwrap(),
                Revision::new("r1").unwrap(),
            )
            .unwrap();
            assert_eq!(obj.sync_state, SyncState::Synced);
            assert!(!obj.dirty);

            obj.mark_dirty().unwrap();
            assert_eq!(obj.sync_state, SyncState::Dirty);
            assert!(obj.dirty);

            obj.transition_to(SyncState::Synced).unwrap();
            assert!(!obj.dirty);
            assert!(obj.last_synced.is_some());
        }

        #[test]
        fn test_mark_dirty_is_idempotent() {
            let mut obj = local_file();
            obj.transition_to(SyncState::Synced).unwrap();
            obj.mark_dirty().unwrap();
            obj.mark_dirty().unwrap();
            assert_eq!(obj.sync_state, SyncState::Dirty);
        }

        #[test]
        fn test_mark_dirty_keeps_pending_push() {
            let mut obj = local_file();
            obj.mark_dirty().unwrap();
            assert_eq!(obj.sync_state, SyncState::PendingPush);
            assert!(obj.dirty);
        }

        #[test]
        fn test_invalid_transition_rejected() {
            let mut obj = local_file();
            obj.transition_to(SyncState::DeletedLocal).unwrap();
            let err = obj.transition_to(SyncState::Dirty).unwrap_err();
            assert!(matches!(err, DomainError::InvalidTransition { .. }));
        }

        #[test]
        fn test_deletion_escapes() {
            // delete-vs-edit: remote deleted, local re-pushes as new.
            let mut obj = local_file();
            obj.transition_to(SyncState::Synced).unwrap();
            obj.transition_to(SyncState::DeletedCloud).unwrap();
            assert!(obj.deleted);
            obj.transition_to(SyncState::PendingPush).unwrap();

            // edit-vs-delete: local delete cancelled, remote restored.
            let mut obj = local_file();
            obj.transition_to(SyncState::Synced).unwrap();
            obj.transition_to(SyncState::DeletedLocal).unwrap();
            obj.transition_to(SyncState::PendingPull).unwrap();
            assert!(!obj.deleted);
        }

        #[test]
        fn test_error_can_retry_anywhere() {
            let mut obj = local_file();
            obj.transition_to(SyncState::Error("boom".into())).unwrap();
            assert!(obj.sync_state.can_transition_to(&SyncState::Synced));
            assert!(obj.sync_state.can_transition_to(&SyncState::PendingPull));
            obj.transition_to(SyncState::PendingPush).unwrap();
        }

        #[test]
        fn test_conflict_outcomes() {
            let mut obj = local_file();
            obj.transition_to(SyncState::Synced).unwrap();
            obj.mark_dirty().unwrap();
            obj.transition_to(SyncState::Conflict).unwrap();
            assert!(obj.sync_state.needs_attention());
            obj.transition_to(SyncState::PendingPush).unwrap();
        }
    }

    mod push_result_tests {
        use super::*;

        #[test]
        fn test_apply_push_result_binds_remote() {
            let mut obj = local_file();
            obj.apply_push_result(
                CloudId::new("doc-1").unwrap(),
                Etag::new("e9").unwrap(),
                Revision::new("r9").unwrap(),
            )
            .unwrap();
            assert_eq!(obj.cloud_id.as_ref().unwrap().as_str(), "doc-1");
            assert_eq!(obj.etag.as_ref().unwrap().as_str(), "e9");
            assert_eq!(obj.sync_state, SyncState::Synced);
            assert!(!obj.missing_from_cloud);
        }

        #[test]
        fn test_conflict_history_accumulates() {
            let mut obj = local_file();
            let displaced = CloudId::new("old-cloud-id").unwrap();
            obj.record_displaced_remote(&displaced, &Etag::new("e2").unwrap());
            obj.record_displaced_remote(&displaced, &Etag::new("e3").unwrap());

            let notes: Vec<serde_json::Value> =
                serde_json::from_str(obj.conflict_history.as_deref().unwrap()).unwrap();
            assert_eq!(notes.len(), 2);
            assert_eq!(notes[0]["displaced_cloud_id"], "old-cloud-id");
        }
    }

    #[test]
    fn test_serialization_roundtrip() {
        let obj = local_file();
        let json = serde_json::to_string(&obj).unwrap();
        let back: Object = serde_json::from_str(&json).unwrap();
        assert_eq!(obj, back);
    }
}
