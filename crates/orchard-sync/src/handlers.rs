//! Per-action handlers.
//!
//! Each handler runs the network call first, then applies effects through a
//! single store transaction (`apply_*` compound operations), so a crash
//! between the two leaves only a re-runnable action behind. Precondition
//! failures are resolved in-line through the conflict protocol rather than
//! bubbling to the classifier.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use orchard_conflict::{assess, local_changed, plan, remote_state, Assessment, ConflictKind,
    RemoteState, ResolutionPlan};
use orchard_core::domain::action::{PRIORITY_BACKGROUND, PRIORITY_INTERACTIVE};
use orchard_core::domain::cache_entry::chunk_byte_range;
use orchard_core::domain::{
    Action, ActionType, CacheEntry, CloudId, Direction, DomainError, Etag, FileHash, Object,
    ObjectKind, Presence, SyncState,
};
use orchard_core::ports::remote::{RemoteChild, RemoteError};

use crate::engine::SyncEngine;
use crate::SyncError;

impl SyncEngine {
    pub(crate) async fn dispatch(&self, action: &Action) -> Result<(), SyncError> {
        match action.action_type {
            ActionType::ListChildren => self.handle_list_children(action).await,
            ActionType::Download => self.handle_download(action).await,
            ActionType::DownloadChunk => self.handle_download_chunk(action).await,
            ActionType::Upload => self.handle_upload(action).await,
            ActionType::UpdateContent => self.handle_update_content(action).await,
            ActionType::Rename | ActionType::Move => self.handle_rename_move(action).await,
            ActionType::Delete => self.handle_delete(action).await,
            ActionType::EnsureLatest => self.handle_ensure_latest(action).await,
        }
    }

    // ========================================================================
    // Pull side
    // ========================================================================

    /// Single-level listing pull: apply every remote entry, tombstone local
    /// cloud children the remote no longer has, and enqueue listings for
    /// discovered subfolders.
    async fn handle_list_children(&self, action: &Action) -> Result<(), SyncError> {
        let Some(folder) = self.store.get_object(&action.target_id).await? else {
            return Ok(self.store.complete_action(action.id).await?);
        };
        let Some(folder_cloud) = folder.cloud_id.clone() else {
            // Purely local folder: nothing remote to list yet.
            return Ok(self.store.complete_action(action.id).await?);
        };

        let children = self.remote.list(&folder_cloud).await?;
        let mut seen: HashSet<String> = HashSet::new();

        for child in &children {
            seen.insert(child.cloud_id.as_str().to_string());
            match self.store.get_object_by_cloud_id(&child.cloud_id).await? {
                Some(local) if !local.deleted => {
                    self.reconcile_listed_child(&folder, &local, child).await?;
                }
                Some(_tombstone) => {
                    // Locally deleted; the queued Delete push will settle it.
                }
                None => {
                    let created = self.store.apply_remote_delta(&folder.id, child).await?;
                    debug!(object_id = %created.id, name = %child.name, "Remote object discovered");
                    if created.kind == ObjectKind::Folder {
                        self.enqueue_list_children(&created.id).await?;
                    }
                }
            }
        }

        // Local cloud-originated children absent from the remote listing.
        for local in self.store.list_cloud_children(&folder.id).await? {
            let Some(local_cloud) = &local.cloud_id else { continue };
            if seen.contains(local_cloud.as_str()) {
                continue;
            }
            self.store.set_missing_from_cloud(&local.id, true).await?;
            let shadow = self.store.get_shadow(&local.id).await?;
            if local_changed(&local, shadow.as_ref()) {
                self.resolve_conflict(&local, ConflictKind::DeleteVsEdit).await?;
            } else {
                info!(object_id = %local.id, "Remote deletion observed, tombstoning");
                self.store.mark_deleted(&local.id, SyncState::DeletedCloud).await?;
                self.store
                    .enqueue(&Action::new(
                        ActionType::Delete,
                        local.id,
                        Direction::Pull,
                        PRIORITY_BACKGROUND,
                    ))
                    .await?;
            }
        }

        // Re-enqueue subfolder listings so the background walk continues;
        // the queue's dedup guard collapses repeats.
        for child in &children {
            if child.kind == ObjectKind::Folder {
                if let Some(local) = self.store.get_object_by_cloud_id(&child.cloud_id).await? {
                    if !local.deleted {
                        self.enqueue_list_children(&local.id).await?;
                    }
                }
            }
        }

        self.store.mark_listed(&folder.id).await?;
        self.store.complete_action(action.id).await?;
        Ok(())
    }

    /// Three-way reconcile for one already-known child of a listing.
    async fn reconcile_listed_child(
        &self,
        folder: &Object,
        local: &Object,
        child: &RemoteChild,
    ) -> Result<(), SyncError> {
        let shadow = self.store.get_shadow(&local.id).await?;
        let lchanged = local_changed(local, shadow.as_ref());
        let rstate = match &shadow {
            Some(s) => remote_state(s, Some((&child.etag, None, &child.name))),
            // No baseline: treat the remote as moved and let the table decide.
            None => RemoteState::Changed,
        };

        match assess(local, lchanged, rstate) {
            Assessment::InSync => {}
            Assessment::PushLocal => {
                // Local intent is already queued; the push path owns it.
            }
            Assessment::PullRemote => {
                let updated = self.store.apply_remote_delta(&folder.id, child).await?;
                if updated.sync_state == SyncState::PendingPull {
                    self.schedule_content_refresh(&updated).await?;
                }
            }
            Assessment::Conflict(kind) => {
                self.resolve_conflict(local, kind).await?;
            }
        }
        Ok(())
    }

    /// Refresh stale cached content after a remote change was applied.
    async fn schedule_content_refresh(&self, object: &Object) -> Result<(), SyncError> {
        if object.kind != ObjectKind::File {
            return Ok(());
        }
        if object.size < self.config.small_file_threshold {
            self.store
                .enqueue(&Action::new(
                    ActionType::Download,
                    object.id,
                    Direction::Pull,
                    PRIORITY_BACKGROUND,
                ))
                .await?;
        } else {
            // Sparse content: drop stale chunks; reads re-materialize lazily.
            self.store.invalidate_chunks(&object.id).await?;
            self.waiters.notify(&object.id);
        }
        Ok(())
    }

    /// Full-file pull for small files: `.part`, atomic rename, entry goes
    /// full, tokens refresh.
    async fn handle_download(&self, action: &Action) -> Result<(), SyncError> {
        let Some(object) = self.store.get_object(&action.target_id).await? else {
            return Ok(self.store.complete_action(action.id).await?);
        };
        if object.deleted {
            return Ok(self.store.complete_action(action.id).await?);
        }
        let Some(cloud_id) = object.cloud_id.clone() else {
            return Err(SyncError::NotReady("object has no remote binding".into()));
        };

        let meta = self.remote.metadata(&cloud_id).await?;
        let bytes = if meta.size == 0 {
            Vec::new()
        } else {
            self.remote.download_range(&cloud_id, 0, meta.size - 1).await?
        };

        self.cache.write_part(&object.id, &bytes)?;
        self.cache.commit_part(&object.id)?;
        let hash = self.cache.file_hash(&object.id)?;

        let mut entry = self
            .store
            .get_cache_entry(&object.id)
            .await?
            .unwrap_or_else(|| {
                CacheEntry::new(object.id, self.cache.path_for(&object.id), meta.size)
            });
        entry.size = meta.size;
        entry.local_path = self.cache.path_for(&object.id);
        self.store.upsert_cache_entry(&entry).await?;

        self.store
            .apply_download_success(action.id, &object.id, hash, Some(meta.etag))
            .await?;
        self.waiters.notify(&object.id);
        info!(object_id = %object.id, size = meta.size, "Full download applied");
        Ok(())
    }

    /// Range pull of one chunk of a sparse file. ETag drift at fetch time
    /// aborts the materialization and reconciles via `EnsureLatest`.
    async fn handle_download_chunk(&self, action: &Action) -> Result<(), SyncError> {
        let Some(index) = action.chunk_index() else {
            return Err(SyncError::Domain(DomainError::ValidationFailed(
                "download_chunk without chunk_index".into(),
            )));
        };
        let Some(object) = self.store.get_object(&action.target_id).await? else {
            return Ok(self.store.complete_action(action.id).await?);
        };
        if object.deleted {
            return Ok(self.store.complete_action(action.id).await?);
        }
        let Some(cloud_id) = object.cloud_id.clone() else {
            return Err(SyncError::NotReady("object has no remote binding".into()));
        };

        let meta = self.remote.metadata(&cloud_id).await?;
        if object.etag.as_ref() != Some(&meta.etag) {
            warn!(
                object_id = %object.id,
                "Remote changed mid-materialization, invalidating chunks"
            );
            self.store.invalidate_chunks(&object.id).await?;
            self.waiters.notify(&object.id);
            self.store
                .enqueue(&Action::new(
                    ActionType::EnsureLatest,
                    object.id,
                    Direction::Pull,
                    PRIORITY_INTERACTIVE,
                ))
                .await?;
            self.store.complete_action(action.id).await?;
            return Ok(());
        }

        let (start, end) = chunk_byte_range(index, object.size, self.config.chunk_size);
        let bytes = self.remote.download_range(&cloud_id, start, end).await?;

        self.cache.reserve(&object.id, object.size)?;
        self.cache.write_chunk(&object.id, start, &bytes)?;

        let mut entry = self
            .store
            .get_cache_entry(&object.id)
            .await?
            .unwrap_or_else(|| {
                CacheEntry::new(object.id, self.cache.path_for(&object.id), object.size)
            });
        if entry.presence != Presence::Sparse {
            entry.presence = Presence::Sparse;
        }
        entry.size = object.size;
        self.store.upsert_cache_entry(&entry).await?;

        let promoted = self
            .store
            .apply_chunk_success(
                Some(action.id),
                &object.id,
                index,
                object.size,
                self.config.chunk_size,
            )
            .await?;
        self.waiters.notify(&object.id);
        debug!(object_id = %object.id, chunk = index, promoted, "Chunk applied");
        Ok(())
    }

    // ========================================================================
    // Push side
    // ========================================================================

    /// First push of a locally created object, or a re-push after the
    /// remote lost it. Sibling collisions resolve by Local Wins.
    async fn handle_upload(&self, action: &Action) -> Result<(), SyncError> {
        let Some(object) = self.store.get_object(&action.target_id).await? else {
            return Ok(self.store.complete_action(action.id).await?);
        };
        if object.deleted {
            // A queued delete superseded this push.
            return Ok(self.store.complete_action(action.id).await?);
        }

        // An object already bound and still present remotely is a content
        // update, not a fresh upload.
        if object.cloud_id.is_some() && !object.missing_from_cloud {
            if let Some(shadow) = self.store.get_shadow(&object.id).await? {
                return self.push_content(action, &object, &shadow.etag).await;
            }
        }

        let parent_cloud = self.parent_cloud_id(&object).await?;

        if object.kind == ObjectKind::Folder {
            let result = self
                .remote
                .create_folder(&parent_cloud, &object.full_name())
                .await?;
            self.store
                .apply_upload_success(
                    action.id,
                    &object.id,
                    result.cloud_id,
                    result.etag,
                    result.revision,
                    None,
                    None,
                    Some(parent_cloud),
                )
                .await?;
            return Ok(());
        }

        let (content, hash) = self.staged_content(&object)?;
        let content_len = content.len() as u64;
        let full_name = object.full_name();

        // Remote sibling with the same name?
        let siblings = self.remote.list(&parent_cloud).await?;
        let collider = siblings.iter().find(|c| c.name == full_name);

        let result = match collider {
            Some(coll) if Some(&coll.cloud_id) == object.cloud_id.as_ref() => {
                // Same object: conditional replace on its current version.
                self.remote
                    .upload(&parent_cloud, &full_name, content, Some(&coll.etag))
                    .await?
            }
            Some(coll) => {
                // A different object holds our name: Local Wins, displace it.
                info!(
                    object_id = %object.id,
                    displaced = %coll.cloud_id,
                    "Name collision on upload, displacing remote object"
                );
                match self.remote.delete(&coll.cloud_id, Some(&coll.etag)).await {
                    Ok(()) | Err(RemoteError::NotFound) => {}
                    Err(RemoteError::PreconditionFailed) => {
                        // Collider moved under us; retry the whole action.
                        return Err(SyncError::NotReady("collider changed during displace".into()));
                    }
                    Err(e) => return Err(e.into()),
                }
                let mut noted = object.clone();
                noted.record_displaced_remote(&coll.cloud_id, &coll.etag);
                self.store.save_object(&noted).await?;
                self.remote.upload(&parent_cloud, &full_name, content, None).await?
            }
            None => self.remote.upload(&parent_cloud, &full_name, content, None).await?,
        };

        self.store
            .apply_upload_success(
                action.id,
                &object.id,
                result.cloud_id,
                result.etag,
                result.revision,
                hash,
                Some(content_len),
                Some(parent_cloud),
            )
            .await?;
        Ok(())
    }

    /// Content push conditional on the shadow's ETag.
    async fn handle_update_content(&self, action: &Action) -> Result<(), SyncError> {
        let Some(object) = self.store.get_object(&action.target_id).await? else {
            return Ok(self.store.complete_action(action.id).await?);
        };
        if object.deleted {
            return Ok(self.store.complete_action(action.id).await?);
        }
        let Some(shadow) = self.store.get_shadow(&object.id).await? else {
            // Never pushed: route through the fresh-upload path.
            return self.handle_upload(action).await;
        };
        let shadow_etag = shadow.etag.clone();
        self.push_content(action, &object, &shadow_etag).await
    }

    /// Shared conditional content push. Precondition failure enters the
    /// conflict protocol for content conflicts.
    async fn push_content(
        &self,
        action: &Action,
        object: &Object,
        if_match: &Etag,
    ) -> Result<(), SyncError> {
        let parent_cloud = self.parent_cloud_id(object).await?;
        let (content, hash) = self.staged_content(object)?;
        let content_len = content.len() as u64;
        let full_name = object.full_name();

        match self
            .remote
            .upload(&parent_cloud, &full_name, content.clone(), Some(if_match))
            .await
        {
            Ok(result) => {
                self.store
                    .apply_upload_success(
                        action.id,
                        &object.id,
                        result.cloud_id,
                        result.etag,
                        result.revision,
                        hash,
                        Some(content_len),
                        Some(parent_cloud),
                    )
                    .await?;
                Ok(())
            }
            Err(RemoteError::PreconditionFailed) => {
                self.resolve_content_precondition(action, object, parent_cloud, content, hash)
                    .await
            }
            Err(RemoteError::NotFound) => {
                // Remote lost the object (or its parent): re-enqueue as a
                // fresh upload.
                self.store.set_missing_from_cloud(&object.id, true).await?;
                self.store
                    .enqueue(&Action::new(
                        ActionType::Upload,
                        object.id,
                        Direction::Push,
                        action.priority,
                    ))
                    .await?;
                self.store.complete_action(action.id).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The ETag-mismatch content conflict, resolved per policy.
    async fn resolve_content_precondition(
        &self,
        action: &Action,
        object: &Object,
        parent_cloud: CloudId,
        content: Vec<u8>,
        hash: Option<FileHash>,
    ) -> Result<(), SyncError> {
        match plan(ConflictKind::Content, self.config.conflict_policy) {
            ResolutionPlan::DisplaceRemoteAndUpload => {
                let cloud_id = object
                    .cloud_id
                    .clone()
                    .ok_or_else(|| SyncError::NotReady("conflict without binding".into()))?;
                // Delete the remote version conditional on its *current*
                // token, then upload the local bytes as new.
                let current = self.remote.metadata(&cloud_id).await?;
                match self.remote.delete(&cloud_id, Some(&current.etag)).await {
                    Ok(()) | Err(RemoteError::NotFound) => {}
                    Err(RemoteError::PreconditionFailed) => {
                        return Err(SyncError::NotReady("remote moved again during displace".into()))
                    }
                    Err(e) => return Err(e.into()),
                }
                let mut noted = object.clone();
                noted.record_displaced_remote(&cloud_id, &current.etag);
                self.store.save_object(&noted).await?;

                let content_len = content.len() as u64;
                let result = self
                    .remote
                    .upload(&parent_cloud, &object.full_name(), content, None)
                    .await?;
                info!(
                    object_id = %object.id,
                    displaced = %cloud_id,
                    "Content conflict resolved: local wins"
                );
                self.store
                    .apply_upload_success(
                        action.id,
                        &object.id,
                        result.cloud_id,
                        result.etag,
                        result.revision,
                        hash,
                        Some(content_len),
                        Some(parent_cloud),
                    )
                    .await?;
                Ok(())
            }
            ResolutionPlan::PullRemote => {
                info!(object_id = %object.id, "Content conflict resolved: remote wins");
                self.store
                    .enqueue(&Action::new(
                        ActionType::Download,
                        object.id,
                        Direction::Pull,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
                self.store.complete_action(action.id).await?;
                Ok(())
            }
            _ => {
                self.store
                    .set_sync_state(&object.id, SyncState::Conflict)
                    .await?;
                self.store.complete_action(action.id).await?;
                Ok(())
            }
        }
    }

    /// Conditional namespace push. The local row is the source of truth:
    /// the handler reconciles both the name and the parent against the
    /// shadow, so rename/move coalescing loses nothing. A colliding
    /// destination name is displaced first (Local Wins).
    async fn handle_rename_move(&self, action: &Action) -> Result<(), SyncError> {
        let Some(object) = self.store.get_object(&action.target_id).await? else {
            return Ok(self.store.complete_action(action.id).await?);
        };
        if object.deleted {
            return Ok(self.store.complete_action(action.id).await?);
        }
        let Some(cloud_id) = object.cloud_id.clone() else {
            // Not yet pushed: the eventual upload carries the new name/parent.
            return Ok(self.store.complete_action(action.id).await?);
        };
        let Some(mut etag) = object.etag.clone() else {
            return Err(SyncError::NotReady("object has no version token yet".into()));
        };
        let Some(shadow) = self.store.get_shadow(&object.id).await? else {
            return Err(SyncError::NotReady("object has no shadow baseline yet".into()));
        };

        let parent_cloud = self.parent_cloud_id(&object).await?;
        let full_name = object.full_name();
        let needs_move = shadow.parent_cloud_id.as_ref() != Some(&parent_cloud);
        let needs_rename = shadow.name != full_name;

        if !needs_move && !needs_rename {
            return Ok(self.store.complete_action(action.id).await?);
        }

        self.displace_rename_collider(&object, &parent_cloud, &full_name).await?;

        let result = async {
            let mut receipt = None;
            if needs_move {
                let r = self.remote.move_to(&cloud_id, &parent_cloud, &etag).await?;
                etag = r.etag.clone();
                receipt = Some(r);
            }
            if needs_rename {
                receipt = Some(self.remote.rename(&cloud_id, &full_name, &etag).await?);
            }
            Ok::<_, RemoteError>(receipt.expect("at least one mutation ran"))
        }
        .await;

        match result {
            Ok(receipt) => {
                self.store
                    .apply_mutation_success(
                        action.id,
                        &object.id,
                        receipt.etag,
                        receipt.revision,
                        Some(parent_cloud),
                    )
                    .await?;
                Ok(())
            }
            Err(RemoteError::PreconditionFailed) => {
                // Our token is stale: reconcile, then decide push or pull.
                self.store
                    .enqueue(&Action::new(
                        ActionType::EnsureLatest,
                        object.id,
                        Direction::Pull,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
                self.store.complete_action(action.id).await?;
                Ok(())
            }
            Err(RemoteError::NotFound) => {
                self.store.set_missing_from_cloud(&object.id, true).await?;
                self.store
                    .enqueue(&Action::new(
                        ActionType::Upload,
                        object.id,
                        Direction::Push,
                        action.priority,
                    ))
                    .await?;
                self.store.complete_action(action.id).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Local Wins on rename collision: remove a remote sibling already
    /// holding the destination name in the destination parent.
    async fn displace_rename_collider(
        &self,
        object: &Object,
        parent_cloud: &CloudId,
        destination: &str,
    ) -> Result<(), SyncError> {
        let siblings = self.remote.list(parent_cloud).await?;
        if let Some(coll) = siblings
            .iter()
            .find(|c| c.name == destination && Some(&c.cloud_id) != object.cloud_id.as_ref())
        {
            info!(
                object_id = %object.id,
                displaced = %coll.cloud_id,
                "Rename collision, displacing remote object"
            );
            match self.remote.delete(&coll.cloud_id, Some(&coll.etag)).await {
                Ok(()) | Err(RemoteError::NotFound) => {}
                Err(RemoteError::PreconditionFailed) => {
                    return Err(SyncError::NotReady("collider changed during displace".into()))
                }
                Err(e) => return Err(e.into()),
            }
            let mut noted = object.clone();
            noted.record_displaced_remote(&coll.cloud_id, &coll.etag);
            self.store.save_object(&noted).await?;
        }
        Ok(())
    }

    /// Delete in either direction, idempotent via tombstones.
    async fn handle_delete(&self, action: &Action) -> Result<(), SyncError> {
        let Some(object) = self.store.get_object(&action.target_id).await? else {
            // Already purged; replay is a no-op.
            return Ok(self.store.complete_action(action.id).await?);
        };

        match object.sync_state {
            SyncState::DeletedLocal => {
                if let Some(cloud_id) = object.cloud_id.clone() {
                    let if_match = self
                        .store
                        .get_shadow(&object.id)
                        .await?
                        .map(|s| s.etag);
                    match self.remote.delete(&cloud_id, if_match.as_ref()).await {
                        Ok(()) | Err(RemoteError::NotFound) => {}
                        Err(RemoteError::PreconditionFailed) => {
                            // Remote edited since our baseline: edit-vs-delete.
                            self.resolve_conflict(&object, ConflictKind::EditVsDelete).await?;
                            self.store.complete_action(action.id).await?;
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                // Both sides now agree; drop the tombstone entirely.
                self.cache.remove(&object.id)?;
                self.waiters.forget(&object.id);
                self.store.purge_object(&object.id).await?;
                self.store.complete_action(action.id).await?;
                info!(object_id = %object.id, "Local deletion pushed and purged");
                Ok(())
            }
            SyncState::DeletedCloud => {
                let entry = self.store.get_cache_entry(&object.id).await?;
                if entry.as_ref().is_some_and(|e| e.open_count > 0) {
                    // Content stays until the last FUSE handle closes;
                    // release() finishes the teardown.
                    debug!(object_id = %object.id, "Remote-deleted file still open, deferring purge");
                    self.store.complete_action(action.id).await?;
                    return Ok(());
                }
                self.cache.remove(&object.id)?;
                self.store.delete_cache_entry(&object.id).await?;
                self.store.delete_shadow(&object.id).await?;
                self.waiters.forget(&object.id);
                // Tombstone row stays for idempotency across restarts.
                self.store.complete_action(action.id).await?;
                info!(object_id = %object.id, "Remote deletion applied locally");
                Ok(())
            }
            _ => {
                // Deletion was cancelled (e.g. edit-vs-delete restore).
                self.store.complete_action(action.id).await?;
                Ok(())
            }
        }
    }

    /// Metadata-only reconcile: compare remote tokens against the shadow
    /// and schedule the appropriate push or pull.
    async fn handle_ensure_latest(&self, action: &Action) -> Result<(), SyncError> {
        let Some(object) = self.store.get_object(&action.target_id).await? else {
            return Ok(self.store.complete_action(action.id).await?);
        };
        let Some(cloud_id) = object.cloud_id.clone() else {
            if object.sync_state.has_pending_push() && !object.deleted {
                self.store
                    .enqueue(&Action::new(
                        ActionType::Upload,
                        object.id,
                        Direction::Push,
                        PRIORITY_BACKGROUND,
                    ))
                    .await?;
            }
            return Ok(self.store.complete_action(action.id).await?);
        };

        let shadow = self.store.get_shadow(&object.id).await?;
        let lchanged = local_changed(&object, shadow.as_ref());

        match self.remote.metadata(&cloud_id).await {
            Err(RemoteError::NotFound) => {
                if object.deleted {
                    // Agreement: both sides deleted.
                    self.cache.remove(&object.id)?;
                    self.store.purge_object(&object.id).await?;
                } else if lchanged {
                    self.resolve_conflict(&object, ConflictKind::DeleteVsEdit).await?;
                } else {
                    self.store.mark_deleted(&object.id, SyncState::DeletedCloud).await?;
                    self.store
                        .enqueue(&Action::new(
                            ActionType::Delete,
                            object.id,
                            Direction::Pull,
                            PRIORITY_BACKGROUND,
                        ))
                        .await?;
                }
                self.store.complete_action(action.id).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
            Ok(meta) => {
                let rstate = match &shadow {
                    Some(s) => remote_state(s, Some((&meta.etag, None, &s.name))),
                    None => RemoteState::Changed,
                };
                match assess(&object, lchanged, rstate) {
                    Assessment::InSync => {}
                    Assessment::PushLocal => {
                        self.store
                            .enqueue(&Action::new(
                                ActionType::UpdateContent,
                                object.id,
                                Direction::Push,
                                PRIORITY_BACKGROUND,
                            ))
                            .await?;
                    }
                    Assessment::PullRemote => {
                        if object.kind == ObjectKind::Folder {
                            self.enqueue_list_children(&object.id).await?;
                        } else {
                            // Move tokens forward first so chunk fetches
                            // validate against the fresh version.
                            self.store
                                .apply_metadata_pull(
                                    &object.id,
                                    meta.etag.clone(),
                                    Some(meta.revision.clone()),
                                    meta.size,
                                )
                                .await?;
                            let refreshed = Object {
                                etag: Some(meta.etag.clone()),
                                size: meta.size,
                                ..object.clone()
                            };
                            self.schedule_content_refresh(&refreshed).await?;
                        }
                    }
                    Assessment::Conflict(kind) => {
                        self.resolve_conflict(&object, kind).await?;
                    }
                }
                self.store.complete_action(action.id).await?;
                Ok(())
            }
        }
    }

    // ========================================================================
    // Conflict execution
    // ========================================================================

    /// Execute a resolution plan by scheduling follow-up actions; the
    /// displace-and-upload protocol itself runs inside the content push.
    async fn resolve_conflict(
        &self,
        object: &Object,
        kind: ConflictKind,
    ) -> Result<(), SyncError> {
        match plan(kind, self.config.conflict_policy) {
            ResolutionPlan::DisplaceRemoteAndUpload => {
                // The conditional push observes the precondition failure and
                // performs the displacement.
                self.store
                    .enqueue(&Action::new(
                        ActionType::UpdateContent,
                        object.id,
                        Direction::Push,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
            }
            ResolutionPlan::PullRemote => {
                self.store
                    .enqueue(&Action::new(
                        ActionType::Download,
                        object.id,
                        Direction::Pull,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
            }
            ResolutionPlan::RepushAsNew => {
                self.store.set_missing_from_cloud(&object.id, true).await?;
                if object.deleted {
                    self.store
                        .set_sync_state(&object.id, SyncState::PendingPush)
                        .await?;
                }
                self.store
                    .enqueue(&Action::new(
                        ActionType::Upload,
                        object.id,
                        Direction::Push,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
            }
            ResolutionPlan::ApplyRemoteDelete => {
                self.store.mark_deleted(&object.id, SyncState::DeletedCloud).await?;
                self.store
                    .enqueue(&Action::new(
                        ActionType::Delete,
                        object.id,
                        Direction::Pull,
                        PRIORITY_BACKGROUND,
                    ))
                    .await?;
            }
            ResolutionPlan::RestoreRemoteCancelDelete => {
                // Cancels the local delete; the pending Delete push no-ops
                // once the state is no longer DeletedLocal.
                self.store
                    .set_sync_state(&object.id, SyncState::PendingPull)
                    .await?;
                self.store
                    .enqueue(&Action::new(
                        ActionType::Download,
                        object.id,
                        Direction::Pull,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
            }
            ResolutionPlan::Surface => {
                self.store
                    .set_sync_state(&object.id, SyncState::Conflict)
                    .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// The remote binding of the object's parent; `NotReady` until the
    /// parent itself has been pushed.
    async fn parent_cloud_id(&self, object: &Object) -> Result<CloudId, SyncError> {
        let Some(parent_id) = object.parent_id else {
            return Err(SyncError::Domain(DomainError::ValidationFailed(
                "root cannot be pushed".into(),
            )));
        };
        let parent = self
            .store
            .get_object(&parent_id)
            .await?
            .ok_or(SyncError::NotReady("parent object missing".into()))?;
        parent
            .cloud_id
            .ok_or_else(|| SyncError::NotReady("parent not yet pushed".into()))
    }

    /// Local bytes presented under the intended remote name. The staging
    /// symlink never moves the cache file; zero-byte objects with no cache
    /// file upload as empty.
    fn staged_content(&self, object: &Object) -> Result<(Vec<u8>, Option<FileHash>), SyncError> {
        if !self.cache.exists(&object.id) {
            return Ok((Vec::new(), None));
        }
        let staged = self.cache.stage_for_upload(&object.id, &object.full_name())?;
        let content = staged.read().map_err(orchard_cache::CacheError::from)?;
        let hash = self.cache.file_hash(&object.id)?;
        Ok((content, Some(hash)))
    }

    async fn enqueue_list_children(
        &self,
        folder_id: &orchard_core::domain::ObjectId,
    ) -> Result<(), SyncError> {
        self.store
            .enqueue(&Action::new(
                ActionType::ListChildren,
                *folder_id,
                Direction::Pull,
                PRIORITY_BACKGROUND,
            ))
            .await?;
        Ok(())
    }
}
