//! Cache-entry and chunk presence rows.
//!
//! The on-disk bytes belong to `orchard-cache`; these rows are the store's
//! authoritative record of what is materialized. Promotion of a sparse entry
//! to full happens here atomically: the presence flips and the chunk rows are
//! purged in one transaction.

use chrono::Utc;

use orchard_core::domain::{
    cache_entry::chunk_count, CacheEntry, Chunk, Etag, FileHash, ObjectId, Presence, SyncState,
};

use crate::row::{cache_entry_from_row, chunk_from_row};
use crate::{StateStore, StoreError};

impl StateStore {
    pub async fn upsert_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cache_entries (
                object_id, local_path, size, file_hash, present_locally,
                pinned, last_accessed, open_count
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(object_id) DO UPDATE SET
                local_path = excluded.local_path,
                size = excluded.size,
                file_hash = excluded.file_hash,
                present_locally = excluded.present_locally,
                pinned = excluded.pinned,
                last_accessed = excluded.last_accessed,
                open_count = excluded.open_count",
        )
        .bind(entry.object_id.to_string())
        .bind(entry.local_path.to_string_lossy().to_string())
        .bind(entry.size as i64)
        .bind(entry.file_hash.as_ref().map(|h| h.as_str().to_string()))
        .bind(entry.presence.as_i64())
        .bind(entry.pinned as i64)
        .bind(entry.last_accessed.to_rfc3339())
        .bind(entry.open_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_cache_entry(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM cache_entries WHERE object_id = ?")
            .bind(object_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cache_entry_from_row).transpose()
    }

    pub async fn set_presence(
        &self,
        object_id: &ObjectId,
        presence: Presence,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_entries SET present_locally = ? WHERE object_id = ?")
            .bind(presence.as_i64())
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Pin or unpin an entry. Unpinning makes it eligible for eviction.
    pub async fn set_pinned(&self, object_id: &ObjectId, pinned: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_entries SET pinned = ? WHERE object_id = ?")
            .bind(pinned as i64)
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Adjust `open_count` by `delta`, clamped at zero. Returns the new count.
    pub async fn adjust_open_count(
        &self,
        object_id: &ObjectId,
        delta: i64,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "UPDATE cache_entries
             SET open_count = max(0, open_count + ?), last_accessed = ?
             WHERE object_id = ?
             RETURNING open_count",
        )
        .bind(delta)
        .bind(Utc::now().to_rfc3339())
        .bind(object_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        use sqlx::Row as _;
        let count: i64 = row.get("open_count");
        Ok(count as u32)
    }

    pub async fn touch_cache_entry(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_entries SET last_accessed = ? WHERE object_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_cache_entry(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cache_entries WHERE object_id = ?")
            .bind(object_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Chunk indices currently present for a sparse entry, ascending.
    pub async fn chunk_indices(&self, object_id: &ObjectId) -> Result<Vec<u32>, StoreError> {
        let rows = sqlx::query(
            "SELECT chunk_index FROM chunks WHERE object_id = ? ORDER BY chunk_index",
        )
        .bind(object_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        use sqlx::Row as _;
        Ok(rows
            .iter()
            .map(|r| r.get::<i64, _>("chunk_index") as u32)
            .collect())
    }

    /// Chunk indices required by the byte range `[offset, offset + len)`
    /// that are not yet present. Empty means the range is servable.
    pub async fn missing_chunks_in_range(
        &self,
        object_id: &ObjectId,
        offset: u64,
        len: u64,
        size: u64,
        chunk_size: u64,
    ) -> Result<Vec<u32>, StoreError> {
        let required =
            orchard_core::domain::cache_entry::chunks_for_range(offset, len, size, chunk_size);
        if required.is_empty() {
            return Ok(Vec::new());
        }
        let present = self.chunk_indices(object_id).await?;
        Ok(required
            .into_iter()
            .filter(|index| !present.contains(index))
            .collect())
    }

    /// Record one landed chunk and promote the entry to full when every
    /// chunk `0 … ⌈size/chunk_size⌉ − 1` is present. Promotion purges the
    /// chunk rows in the same transaction. Returns true on promotion.
    pub async fn apply_chunk_success(
        &self,
        action_id: Option<i64>,
        object_id: &ObjectId,
        chunk_index: u32,
        size: u64,
        chunk_size: u64,
    ) -> Result<bool, StoreError> {
        let total = chunk_count(size, chunk_size);
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO chunks (object_id, chunk_index, last_accessed) VALUES (?, ?, ?)
             ON CONFLICT(object_id, chunk_index) DO UPDATE SET last_accessed = excluded.last_accessed",
        )
        .bind(object_id.to_string())
        .bind(i64::from(chunk_index))
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks WHERE object_id = ?")
            .bind(object_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        use sqlx::Row as _;
        let present: i64 = row.get("n");
        let promoted = present as u32 >= total;

        if promoted {
            sqlx::query("UPDATE cache_entries SET present_locally = 1 WHERE object_id = ?")
                .bind(object_id.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE object_id = ?")
                .bind(object_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        if let Some(action_id) = action_id {
            crate::objects::complete_action_in(&mut *tx, action_id).await?;
        }
        tx.commit().await?;

        if promoted {
            tracing::debug!(object_id = %object_id, "Sparse entry promoted to full");
        }
        Ok(promoted)
    }

    /// Drop every chunk row and reset the entry to absent. Used when the
    /// remote ETag drifted mid-materialization.
    pub async fn invalidate_chunks(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE object_id = ?")
            .bind(object_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE cache_entries SET present_locally = 0 WHERE object_id = ?")
            .bind(object_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove specific chunk rows after hole-punching their bytes.
    pub async fn remove_chunks(
        &self,
        object_id: &ObjectId,
        indices: &[u32],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for index in indices {
            sqlx::query("DELETE FROM chunks WHERE object_id = ? AND chunk_index = ?")
                .bind(object_id.to_string())
                .bind(i64::from(*index))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Least-recently-accessed chunks across evictable sparse entries.
    pub async fn oldest_chunks(&self, limit: u32) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.* FROM chunks c
             JOIN cache_entries e ON e.object_id = c.object_id
             WHERE e.pinned = 0 AND e.open_count = 0
             ORDER BY c.last_accessed ASC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// Evictable full entries, least recently accessed first.
    pub async fn evictable_full_entries(&self, limit: u32) -> Result<Vec<CacheEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM cache_entries
             WHERE present_locally = 1 AND pinned = 0 AND open_count = 0
             ORDER BY last_accessed ASC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cache_entry_from_row).collect()
    }

    /// Apply a completed full-file download in one transaction: entry goes
    /// full with the fresh hash, the object's token and state settle, and
    /// the action completes.
    pub async fn apply_download_success(
        &self,
        action_id: i64,
        object_id: &ObjectId,
        file_hash: FileHash,
        etag: Option<Etag>,
    ) -> Result<(), StoreError> {
        let mut object = self.get_object(object_id).await?.ok_or(StoreError::NotFound)?;
        object.content_hash = Some(file_hash.clone());
        if let Some(etag) = &etag {
            object.etag = Some(etag.clone());
        }
        if !object.deleted {
            object.transition_to(SyncState::Synced)?;
        }

        let mut tx = self.pool.begin().await?;
        crate::objects::save_object_in(&mut *tx, &object).await?;
        sqlx::query(
            "UPDATE cache_entries SET present_locally = 1, file_hash = ?, last_accessed = ?
             WHERE object_id = ?",
        )
        .bind(file_hash.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(object_id.to_string())
        .execute(&mut *tx)
        .await?;
        if let Some(etag) = &etag {
            sqlx::query("UPDATE shadows SET etag = ?, file_hash = ?, observed_at = ? WHERE object_id = ?")
                .bind(etag.as_str())
                .bind(file_hash.as_str())
                .bind(Utc::now().to_rfc3339())
                .bind(object_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        crate::objects::complete_action_in(&mut *tx, action_id).await?;
        tx.commit().await?;
        Ok(())
    }
}
