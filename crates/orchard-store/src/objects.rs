//! Object and shadow operations.
//!
//! Compound changes (apply a push result, apply a remote delta) run inside a
//! single transaction so observers always see a consistent tree. Sync-state
//! transitions are validated through the domain state machine before any row
//! is written.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::{Executor, Sqlite};

use orchard_core::domain::{
    CloudId, DomainError, Etag, FileHash, Object, ObjectId, ObjectKind, Revision, Shadow,
    SyncState,
};
use orchard_core::ports::remote::RemoteChild;

use crate::row::{
    object_from_row, parse_optional_datetime, shadow_from_row, sync_state_to_string,
};
use crate::{StateStore, StoreError};

impl StateStore {
    // ========================================================================
    // Row primitives
    // ========================================================================

    /// Insert or replace a full object row.
    pub async fn save_object(&self, object: &Object) -> Result<(), StoreError> {
        save_object_in(&self.pool, object).await
    }

    /// Fetch an object by id.
    pub async fn get_object(&self, id: &ObjectId) -> Result<Option<Object>, StoreError> {
        let row = sqlx::query("SELECT * FROM objects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    /// Fetch an object by its remote binding.
    pub async fn get_object_by_cloud_id(
        &self,
        cloud_id: &CloudId,
    ) -> Result<Option<Object>, StoreError> {
        let row = sqlx::query("SELECT * FROM objects WHERE cloud_id = ?")
            .bind(cloud_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    /// The root object, creating it on first use.
    pub async fn ensure_root(&self, cloud_id: Option<CloudId>) -> Result<Object, StoreError> {
        if let Some(root) = self.root().await? {
            return Ok(root);
        }
        let root = Object::root(cloud_id);
        self.save_object(&root).await?;
        tracing::info!(object_id = %root.id, "Root object created");
        Ok(root)
    }

    /// The root object, if initialized.
    pub async fn root(&self) -> Result<Option<Object>, StoreError> {
        let row = sqlx::query("SELECT * FROM objects WHERE parent_id IS NULL")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    // ========================================================================
    // Tree queries
    // ========================================================================

    /// Look up a non-deleted child by `(parent, name, extension)`.
    /// Case-sensitive.
    pub async fn find_child(
        &self,
        parent_id: &ObjectId,
        name: &str,
        extension: Option<&str>,
    ) -> Result<Option<Object>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM objects
             WHERE parent_id = ? AND name = ? AND ifnull(extension, '') = ? AND deleted = 0",
        )
        .bind(parent_id.to_string())
        .bind(name)
        .bind(extension.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    /// Walk the tree from the root by path segments.
    ///
    /// `path` is relative to the mount root (`"docs/report.pdf"` or
    /// `"/docs/report.pdf"`). Empty path resolves to the root.
    pub async fn resolve_path(&self, path: &str) -> Result<Object, StoreError> {
        let mut current = self.root().await?.ok_or(StoreError::NotFound)?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let (name, extension) = Object::split_name(segment);
            current = self
                .find_child(&current.id, &name, extension.as_deref())
                .await?
                .ok_or(StoreError::NotFound)?;
        }
        Ok(current)
    }

    /// Non-deleted children of a folder, ordered by name.
    pub async fn list_children(&self, parent_id: &ObjectId) -> Result<Vec<Object>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM objects WHERE parent_id = ? AND deleted = 0
             ORDER BY name, ifnull(extension, '')",
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(object_from_row).collect()
    }

    /// Cloud-originated, non-deleted children — the set `list_children`
    /// reconciles against a remote listing.
    pub async fn list_cloud_children(
        &self,
        parent_id: &ObjectId,
    ) -> Result<Vec<Object>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM objects
             WHERE parent_id = ? AND deleted = 0 AND origin = 'cloud' AND cloud_id IS NOT NULL",
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(object_from_row).collect()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create a locally originated object (FUSE `create`/`mkdir`).
    ///
    /// Fails with [`DomainError::AlreadyExists`] when a living sibling holds
    /// the same `(name, extension)`.
    pub async fn create_local_object(
        &self,
        parent_id: &ObjectId,
        full_name: &str,
        kind: ObjectKind,
    ) -> Result<Object, StoreError> {
        let object = Object::new_local(*parent_id, full_name, kind)?;

        let mut tx = self.pool.begin().await?;
        let (name, extension) = Object::split_name(full_name);
        let collision = sqlx::query(
            "SELECT 1 FROM objects
             WHERE parent_id = ? AND name = ? AND ifnull(extension, '') = ? AND deleted = 0",
        )
        .bind(parent_id.to_string())
        .bind(&name)
        .bind(extension.as_deref().unwrap_or(""))
        .fetch_optional(&mut *tx)
        .await?;
        if collision.is_some() {
            return Err(DomainError::AlreadyExists(full_name.to_string()).into());
        }
        save_object_in(&mut *tx, &object).await?;
        tx.commit().await?;

        tracing::debug!(object_id = %object.id, name = full_name, "Local object created");
        Ok(object)
    }

    /// Create or update an object from one remote listing entry, rewriting
    /// its shadow in the same transaction. Cache content is never touched
    /// here; a stale cached file flips the object to `PendingPull` for the
    /// engine to refresh.
    pub async fn apply_remote_delta(
        &self,
        parent_id: &ObjectId,
        child: &RemoteChild,
    ) -> Result<Object, StoreError> {
        let existing = self.get_object_by_cloud_id(&child.cloud_id).await?;
        let parent_cloud_id = self
            .get_object(parent_id)
            .await?
            .and_then(|parent| parent.cloud_id);

        let mut tx = self.pool.begin().await?;
        let object = match existing {
            Some(mut object) => {
                let etag_changed = object.etag.as_ref() != Some(&child.etag);
                let cached = sqlx::query(
                    "SELECT present_locally FROM cache_entries WHERE object_id = ? AND present_locally != 0",
                )
                .bind(object.id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .is_some();

                let (name, extension) = Object::split_name(&child.name);
                object.name = name;
                object.extension = extension;
                object.size = child.size;
                object.cloud_modified_at = Some(child.modified_at);
                object.etag = Some(child.etag.clone());
                object.missing_from_cloud = false;
                let target = if etag_changed && cached {
                    SyncState::PendingPull
                } else {
                    SyncState::Synced
                };
                object.transition_to(target)?;
                save_object_in(&mut *tx, &object).await?;
                object
            }
            None => {
                let object = Object::new_from_cloud(
                    *parent_id,
                    &child.name,
                    child.kind,
                    child.cloud_id.clone(),
                    child.size,
                    child.etag.clone(),
                    child.modified_at,
                )?;
                save_object_in(&mut *tx, &object).await?;
                object
            }
        };

        let shadow = Shadow::observe(
            object.id,
            child.cloud_id.clone(),
            parent_cloud_id,
            child.name.clone(),
            child.etag.clone(),
            None,
            child.modified_at,
        );
        save_shadow_in(&mut *tx, &shadow).await?;
        tx.commit().await?;

        Ok(object)
    }

    /// Mark an object dirty after a local content write. Idempotent.
    pub async fn mark_dirty(&self, id: &ObjectId) -> Result<(), StoreError> {
        let mut object = self.get_object(id).await?.ok_or(StoreError::NotFound)?;
        object.mark_dirty()?;
        self.save_object(&object).await
    }

    /// Record the logical size after a local write or truncate.
    pub async fn set_object_size(&self, id: &ObjectId, size: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE objects SET size = ? WHERE id = ?")
            .bind(size as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply a successful first upload or content update.
    ///
    /// One transaction: bind the remote identity and tokens on the object,
    /// rewrite the shadow, refresh the cache-entry hash, and complete the
    /// action. Failures before commit leave the shadow untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_upload_success(
        &self,
        action_id: i64,
        object_id: &ObjectId,
        cloud_id: CloudId,
        etag: Etag,
        revision: Revision,
        file_hash: Option<FileHash>,
        content_size: Option<u64>,
        parent_cloud_id: Option<CloudId>,
    ) -> Result<Object, StoreError> {
        let mut object = self.get_object(object_id).await?.ok_or(StoreError::NotFound)?;
        object.apply_push_result(cloud_id.clone(), etag.clone(), revision)?;
        object.content_hash = file_hash.clone();
        if let Some(size) = content_size {
            object.size = size;
        }

        let shadow = Shadow::observe(
            object.id,
            cloud_id,
            parent_cloud_id,
            object.full_name(),
            etag,
            file_hash.clone(),
            Utc::now(),
        );

        let mut tx = self.pool.begin().await?;
        save_object_in(&mut *tx, &object).await?;
        save_shadow_in(&mut *tx, &shadow).await?;
        if let Some(hash) = &file_hash {
            sqlx::query("UPDATE cache_entries SET file_hash = ? WHERE object_id = ?")
                .bind(hash.as_str())
                .bind(object.id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        complete_action_in(&mut *tx, action_id).await?;
        tx.commit().await?;

        tracing::info!(object_id = %object.id, "Upload applied");
        Ok(object)
    }

    /// Apply a successful rename/move: rewrite tokens and shadow (name and
    /// remote parent), complete the action, all in one transaction.
    pub async fn apply_mutation_success(
        &self,
        action_id: i64,
        object_id: &ObjectId,
        etag: Etag,
        revision: Revision,
        parent_cloud_id: Option<CloudId>,
    ) -> Result<(), StoreError> {
        let mut object = self.get_object(object_id).await?.ok_or(StoreError::NotFound)?;
        object.etag = Some(etag.clone());
        object.revision = Some(revision);
        if !object.deleted {
            object.transition_to(SyncState::Synced)?;
        }

        let mut tx = self.pool.begin().await?;
        save_object_in(&mut *tx, &object).await?;
        sqlx::query(
            "UPDATE shadows SET etag = ?, name = ?, parent_cloud_id = ?, observed_at = ?
             WHERE object_id = ?",
        )
        .bind(etag.as_str())
        .bind(object.full_name())
        .bind(parent_cloud_id.as_ref().map(|c| c.as_str().to_string()))
        .bind(Utc::now().to_rfc3339())
        .bind(object.id.to_string())
        .execute(&mut *tx)
        .await?;
        complete_action_in(&mut *tx, action_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply a metadata-only pull: refresh the object's remote tokens and
    /// size, and move the shadow baseline forward, in one transaction.
    /// Content refresh is scheduled separately by the engine.
    pub async fn apply_metadata_pull(
        &self,
        object_id: &ObjectId,
        etag: Etag,
        revision: Option<Revision>,
        size: u64,
    ) -> Result<(), StoreError> {
        let mut object = self.get_object(object_id).await?.ok_or(StoreError::NotFound)?;
        object.etag = Some(etag.clone());
        if revision.is_some() {
            object.revision = revision;
        }
        object.size = size;

        let mut tx = self.pool.begin().await?;
        save_object_in(&mut *tx, &object).await?;
        sqlx::query("UPDATE shadows SET etag = ?, observed_at = ? WHERE object_id = ?")
            .bind(etag.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(object_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Rename and/or reparent an object row atomically (FUSE `rename`).
    ///
    /// Collision with a living sibling at the destination is rejected.
    pub async fn rename_object(
        &self,
        id: &ObjectId,
        new_parent_id: &ObjectId,
        new_full_name: &str,
    ) -> Result<Object, StoreError> {
        Object::validate_name(new_full_name)?;
        let mut object = self.get_object(id).await?.ok_or(StoreError::NotFound)?;
        let (name, extension) = Object::split_name(new_full_name);

        let mut tx = self.pool.begin().await?;
        let collision = sqlx::query(
            "SELECT 1 FROM objects
             WHERE parent_id = ? AND name = ? AND ifnull(extension, '') = ?
               AND deleted = 0 AND id != ?",
        )
        .bind(new_parent_id.to_string())
        .bind(&name)
        .bind(extension.as_deref().unwrap_or(""))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        if collision.is_some() {
            return Err(DomainError::AlreadyExists(new_full_name.to_string()).into());
        }

        object.parent_id = Some(*new_parent_id);
        object.name = name;
        object.extension = extension;
        object.local_modified_at = Utc::now();
        if matches!(object.sync_state, SyncState::Synced) {
            object.transition_to(SyncState::PendingPush)?;
        }
        save_object_in(&mut *tx, &object).await?;
        tx.commit().await?;
        Ok(object)
    }

    /// Mark an object deleted in the given direction.
    pub async fn mark_deleted(
        &self,
        id: &ObjectId,
        direction: SyncState,
    ) -> Result<Object, StoreError> {
        debug_assert!(matches!(
            direction,
            SyncState::DeletedLocal | SyncState::DeletedCloud
        ));
        let mut object = self.get_object(id).await?.ok_or(StoreError::NotFound)?;
        if object.is_root() {
            return Err(DomainError::ValidationFailed("root cannot be deleted".into()).into());
        }
        object.transition_to(direction)?;
        self.save_object(&object).await?;
        Ok(object)
    }

    /// Remove a tombstone row once both sides have confirmed the deletion.
    /// Cascades to shadow, cache entry, and chunk rows.
    pub async fn purge_object(&self, id: &ObjectId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Validated sync-state transition.
    pub async fn set_sync_state(
        &self,
        id: &ObjectId,
        target: SyncState,
    ) -> Result<Object, StoreError> {
        let mut object = self.get_object(id).await?.ok_or(StoreError::NotFound)?;
        object.transition_to(target)?;
        self.save_object(&object).await?;
        Ok(object)
    }

    /// Stamp a folder as freshly listed. `last_synced = NULL` on a folder
    /// means it has never been listed against the remote.
    pub async fn mark_listed(&self, id: &ObjectId) -> Result<(), StoreError> {
        sqlx::query("UPDATE objects SET last_synced = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flag an object the remote listing no longer contains.
    pub async fn set_missing_from_cloud(
        &self,
        id: &ObjectId,
        missing: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE objects SET missing_from_cloud = ? WHERE id = ?")
            .bind(missing as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Shadows
    // ========================================================================

    pub async fn get_shadow(&self, object_id: &ObjectId) -> Result<Option<Shadow>, StoreError> {
        let row = sqlx::query("SELECT * FROM shadows WHERE object_id = ?")
            .bind(object_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(shadow_from_row).transpose()
    }

    pub async fn put_shadow(&self, shadow: &Shadow) -> Result<(), StoreError> {
        save_shadow_in(&self.pool, shadow).await
    }

    pub async fn delete_shadow(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM shadows WHERE object_id = ?")
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Queries for the control surface
    // ========================================================================

    /// Object counts grouped by sync-state name.
    pub async fn counts_by_state(&self) -> Result<HashMap<String, u64>, StoreError> {
        let rows = sqlx::query(
            "SELECT CASE WHEN sync_state LIKE 'error:%' THEN 'error' ELSE sync_state END AS s,
                    COUNT(*) AS n
             FROM objects GROUP BY s",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut map = HashMap::new();
        for row in rows {
            use sqlx::Row as _;
            let state: String = row.get("s");
            let count: i64 = row.get("n");
            map.insert(state, count as u64);
        }
        Ok(map)
    }

    /// Objects currently surfaced as conflicts.
    pub async fn list_conflicts(&self) -> Result<Vec<Object>, StoreError> {
        let rows = sqlx::query("SELECT * FROM objects WHERE sync_state = 'conflict'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(object_from_row).collect()
    }

    /// Tombstones whose deletion both sides have yet to confirm.
    pub async fn list_tombstones(&self) -> Result<Vec<Object>, StoreError> {
        let rows = sqlx::query("SELECT * FROM objects WHERE deleted = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(object_from_row).collect()
    }

    /// When the object's last sync was recorded, from the row itself.
    pub async fn last_synced(&self, id: &ObjectId) -> Result<Option<chrono::DateTime<chrono::Utc>>, StoreError> {
        let row = sqlx::query("SELECT last_synced FROM objects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        use sqlx::Row as _;
        let s: Option<String> = row.get("last_synced");
        parse_optional_datetime(s)
    }
}

// ============================================================================
// Shared writers usable inside transactions
// ============================================================================

pub(crate) async fn save_object_in<'e, E>(executor: E, object: &Object) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO objects (
            id, cloud_id, kind, parent_id, name, extension, size,
            local_modified_at, cloud_modified_at, etag, revision, origin,
            sync_state, dirty, deleted, missing_from_cloud, last_synced,
            content_hash, conflict_history
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            cloud_id = excluded.cloud_id,
            kind = excluded.kind,
            parent_id = excluded.parent_id,
            name = excluded.name,
            extension = excluded.extension,
            size = excluded.size,
            local_modified_at = excluded.local_modified_at,
            cloud_modified_at = excluded.cloud_modified_at,
            etag = excluded.etag,
            revision = excluded.revision,
            origin = excluded.origin,
            sync_state = excluded.sync_state,
            dirty = excluded.dirty,
            deleted = excluded.deleted,
            missing_from_cloud = excluded.missing_from_cloud,
            last_synced = excluded.last_synced,
            content_hash = excluded.content_hash,
            conflict_history = excluded.conflict_history",
    )
    .bind(object.id.to_string())
    .bind(object.cloud_id.as_ref().map(|c| c.as_str().to_string()))
    .bind(object.kind.as_str())
    .bind(object.parent_id.map(|p| p.to_string()))
    .bind(&object.name)
    .bind(&object.extension)
    .bind(object.size as i64)
    .bind(object.local_modified_at.to_rfc3339())
    .bind(object.cloud_modified_at.map(|d| d.to_rfc3339()))
    .bind(object.etag.as_ref().map(|e| e.as_str().to_string()))
    .bind(object.revision.as_ref().map(|r| r.as_str().to_string()))
    .bind(object.origin.as_str())
    .bind(sync_state_to_string(&object.sync_state))
    .bind(object.dirty as i64)
    .bind(object.deleted as i64)
    .bind(object.missing_from_cloud as i64)
    .bind(object.last_synced.map(|d| d.to_rfc3339()))
    .bind(object.content_hash.as_ref().map(|h| h.as_str().to_string()))
    .bind(&object.conflict_history)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn save_shadow_in<'e, E>(executor: E, shadow: &Shadow) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO shadows (
            object_id, cloud_id, parent_cloud_id, name, etag, file_hash,
            modified_at, observed_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(object_id) DO UPDATE SET
            cloud_id = excluded.cloud_id,
            parent_cloud_id = excluded.parent_cloud_id,
            name = excluded.name,
            etag = excluded.etag,
            file_hash = excluded.file_hash,
            modified_at = excluded.modified_at,
            observed_at = excluded.observed_at",
    )
    .bind(shadow.object_id.to_string())
    .bind(shadow.cloud_id.as_str())
    .bind(shadow.parent_cloud_id.as_ref().map(|c| c.as_str().to_string()))
    .bind(&shadow.name)
    .bind(shadow.etag.as_str())
    .bind(shadow.file_hash.as_ref().map(|h| h.as_str().to_string()))
    .bind(shadow.modified_at.to_rfc3339())
    .bind(shadow.observed_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn complete_action_in<'e, E>(executor: E, action_id: i64) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE actions SET status = 'completed', worker_id = NULL WHERE id = ?")
        .bind(action_id)
        .execute(executor)
        .await?;
    Ok(())
}
