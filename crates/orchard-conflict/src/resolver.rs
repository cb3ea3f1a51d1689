//! Policy-driven conflict resolution planning.

use orchard_core::config::ConflictPolicy;
use tracing::info;

use crate::detector::ConflictKind;

/// Concrete plan the sync engine executes for a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPlan {
    /// Local Wins for content: delete the remote version (conditional on
    /// its current ETag), upload the local bytes as new, and note the
    /// displaced `cloud_id` in the object's conflict history.
    DisplaceRemoteAndUpload,
    /// Remote Wins for content: drop local intent and pull the remote.
    PullRemote,
    /// Delete-vs-edit: re-push the locally edited object as a new cloud
    /// object (undelete).
    RepushAsNew,
    /// Delete-vs-edit under Remote Wins: accept the remote deletion.
    ApplyRemoteDelete,
    /// Edit-vs-delete: restore the remote version locally and cancel the
    /// local delete.
    RestoreRemoteCancelDelete,
    /// Leave the object in `sync_state = conflict` for the control API.
    Surface,
}

/// Map a conflict kind through the configured policy.
///
/// Edit-vs-delete restores the remote version under both automatic
/// policies: the stated default is restore-and-cancel, and under Remote
/// Wins the remote edit wins by definition.
#[must_use]
pub fn plan(kind: ConflictKind, policy: ConflictPolicy) -> ResolutionPlan {
    let plan = match (kind, policy) {
        (_, ConflictPolicy::Manual) => ResolutionPlan::Surface,

        (ConflictKind::Content, ConflictPolicy::LocalWins) => {
            ResolutionPlan::DisplaceRemoteAndUpload
        }
        (ConflictKind::Content, ConflictPolicy::RemoteWins) => ResolutionPlan::PullRemote,

        (ConflictKind::DeleteVsEdit, ConflictPolicy::LocalWins) => ResolutionPlan::RepushAsNew,
        (ConflictKind::DeleteVsEdit, ConflictPolicy::RemoteWins) => {
            ResolutionPlan::ApplyRemoteDelete
        }

        (ConflictKind::EditVsDelete, _) => ResolutionPlan::RestoreRemoteCancelDelete,
    };
    info!(kind = ?kind, policy = policy.as_str(), plan = ?plan, "Conflict resolution planned");
    plan
}
