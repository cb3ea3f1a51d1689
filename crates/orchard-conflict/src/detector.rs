//! Three-way conflict detection.
//!
//! |  local changed? | remote changed? | outcome     |
//! |-----------------|-----------------|-------------|
//! | no              | no              | no-op       |
//! | yes             | no              | push local  |
//! | no              | yes             | pull remote |
//! | yes             | yes             | conflict    |
//!
//! "Changed" means the content hash or relevant metadata differs from the
//! shadow baseline. Deletions are a changed-state of their own kind and
//! produce the two asymmetric conflict cases.

use tracing::debug;

use orchard_core::domain::{Etag, FileHash, Object, Shadow};

/// What the remote looks like relative to the shadow baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Unchanged,
    Changed,
    Deleted,
}

/// The flavor of a both-sides-changed conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both sides edited the content.
    Content,
    /// Local edit, remote delete.
    DeleteVsEdit,
    /// Local delete, remote edit.
    EditVsDelete,
}

/// Outcome of the three-way comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Nothing to do.
    InSync,
    /// Only local intent; safe to push.
    PushLocal,
    /// Only remote change; safe to pull.
    PullRemote,
    /// Both sides moved; enter the conflict protocol.
    Conflict(ConflictKind),
}

/// Whether the object carries local changes relative to its shadow.
///
/// A dirty flag or a pending local delete is local intent by definition;
/// otherwise the local content hash is compared against the baseline.
#[must_use]
pub fn local_changed(object: &Object, shadow: Option<&Shadow>) -> bool {
    if object.dirty || object.sync_state.has_pending_push() {
        return true;
    }
    let Some(shadow) = shadow else {
        // No baseline: a cloud object freshly listed has no local intent.
        return false;
    };
    match (&object.content_hash, &shadow.file_hash) {
        (Some(local), Some(base)) => local != base,
        _ => false,
    }
}

/// Classify the observed remote against the shadow baseline.
#[must_use]
pub fn remote_state(
    shadow: &Shadow,
    observed: Option<(&Etag, Option<&FileHash>, &str)>,
) -> RemoteState {
    match observed {
        None => RemoteState::Deleted,
        Some((etag, hash, name)) => {
            if shadow.remote_changed(etag, hash, name) {
                RemoteState::Changed
            } else {
                RemoteState::Unchanged
            }
        }
    }
}

/// The three-way decision table.
#[must_use]
pub fn assess(object: &Object, local: bool, remote: RemoteState) -> Assessment {
    let local_deleted = object.deleted;
    let assessment = match (local, remote) {
        (false, RemoteState::Unchanged) => Assessment::InSync,
        (true, RemoteState::Unchanged) => Assessment::PushLocal,
        (false, RemoteState::Changed) => Assessment::PullRemote,
        (false, RemoteState::Deleted) => Assessment::PullRemote,
        (true, RemoteState::Changed) => {
            if local_deleted {
                Assessment::Conflict(ConflictKind::EditVsDelete)
            } else {
                Assessment::Conflict(ConflictKind::Content)
            }
        }
        (true, RemoteState::Deleted) => {
            if local_deleted {
                // Both sides deleted: agreement, not conflict.
                Assessment::InSync
            } else {
                Assessment::Conflict(ConflictKind::DeleteVsEdit)
            }
        }
    };
    debug!(
        object_id = %object.id,
        local,
        remote = ?remote,
        outcome = ?assessment,
        "Three-way assessment"
    );
    assessment
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use orchard_core::domain::{CloudId, ObjectId, ObjectKind, SyncState};

    use super::*;

    fn object() -> Object {
        let mut o = Object::new_local(ObjectId::new(), "f.txt", ObjectKind::File).unwrap();
        o.transition_to(SyncState::Synced).unwrap();
        o
    }

    fn shadow_for(o: &Object, etag: &str, hash: Option<&FileHash>) -> Shadow {
        Shadow::observe(
            o.id,
            CloudId::new("c1").unwrap(),
            None,
            "f.txt",
            Etag::new(etag).unwrap(),
            hash.cloned(),
            Utc::now(),
        )
    }

    #[test]
    fn test_decision_table() {
        let o = object();
        assert_eq!(assess(&o, false, RemoteState::Unchanged), Assessment::InSync);
        assert_eq!(assess(&o, true, RemoteState::Unchanged), Assessment::PushLocal);
        assert_eq!(assess(&o, false, RemoteState::Changed), Assessment::PullRemote);
        assert_eq!(
            assess(&o, true, RemoteState::Changed),
            Assessment::Conflict(ConflictKind::Content)
        );
    }

    #[test]
    fn test_remote_delete_cases() {
        let mut o = object();
        // Untouched local + remote delete is just a pull (apply the delete).
        assert_eq!(assess(&o, false, RemoteState::Deleted), Assessment::PullRemote);
        // Local edit + remote delete.
        assert_eq!(
            assess(&o, true, RemoteState::Deleted),
            Assessment::Conflict(ConflictKind::DeleteVsEdit)
        );
        // Local delete + remote edit.
        o.transition_to(SyncState::DeletedLocal).unwrap();
        assert_eq!(
            assess(&o, true, RemoteState::Changed),
            Assessment::Conflict(ConflictKind::EditVsDelete)
        );
        // Both deleted: agreement.
        assert_eq!(assess(&o, true, RemoteState::Deleted), Assessment::InSync);
    }

    #[test]
    fn test_local_changed_via_dirty_flag() {
        let mut o = object();
        let s = shadow_for(&o, "e1", None);
        assert!(!local_changed(&o, Some(&s)));
        o.mark_dirty().unwrap();
        assert!(local_changed(&o, Some(&s)));
    }

    #[test]
    fn test_local_changed_via_hash_mismatch() {
        let mut o = object();
        let base = FileHash::new("a".repeat(64)).unwrap();
        let s = shadow_for(&o, "e1", Some(&base));
        o.content_hash = Some(base.clone());
        assert!(!local_changed(&o, Some(&s)));
        o.content_hash = Some(FileHash::new("b".repeat(64)).unwrap());
        assert!(local_changed(&o, Some(&s)));
    }

    #[test]
    fn test_remote_state_classification() {
        let o = object();
        let s = shadow_for(&o, "e1", None);
        let e1 = Etag::new("e1").unwrap();
        let e2 = Etag::new("e2").unwrap();

        assert_eq!(remote_state(&s, Some((&e1, None, "f.txt"))), RemoteState::Unchanged);
        assert_eq!(remote_state(&s, Some((&e2, None, "f.txt"))), RemoteState::Changed);
        assert_eq!(remote_state(&s, Some((&e1, None, "renamed.txt"))), RemoteState::Changed);
        assert_eq!(remote_state(&s, None), RemoteState::Deleted);
    }
}
