//! Durable, prioritized, coalescing action queue.
//!
//! Coalescing happens at enqueue time under the same transaction that
//! inserts, so invariants hold for any observer:
//!
//! - consecutive pending `UpdateContent` on one target collapse to one
//!   (content is read from the cache at claim time, so latest wins);
//! - consecutive `Rename`/`Move` collapse, keeping the final destination;
//! - an `Upload` supersedes any pending `UpdateContent` for the target;
//! - `Delete` cancels every pending push for the target;
//! - `DownloadChunk` deduplicates on `(target, chunk_index)`.
//!
//! `claim_next` is a single atomic `UPDATE … RETURNING` that picks the
//! highest-priority, oldest, unclaimed action whose target has no action
//! currently processing — actions for one target execute in FIFO order.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sqlx::Row as _;

use orchard_core::domain::{Action, ActionType, ObjectId};

use crate::row::action_from_row;
use crate::{StateStore, StoreError};

/// Which actions a worker claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerClass {
    /// Uploads, downloads, chunk transfers.
    Io,
    /// Short latency-sensitive metadata operations.
    Meta,
    /// Anything (used by tests and the drain path).
    Any,
}

impl WorkerClass {
    fn sql_filter(&self) -> &'static str {
        match self {
            WorkerClass::Io => {
                "AND action_type IN ('upload', 'download', 'download_chunk', 'update_content', 'delete')"
            }
            WorkerClass::Meta => {
                "AND action_type IN ('list_children', 'rename', 'move', 'ensure_latest')"
            }
            WorkerClass::Any => "",
        }
    }
}

/// Retry backoff parameters (`base · 2^retry_count` with jitter, capped).
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_retries: u32,
}

impl BackoffConfig {
    /// Delay before the next attempt, with ±25% jitter.
    #[must_use]
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let exp = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(retry_count))
            .min(self.max_ms);
        let jitter_span = exp / 4;
        if jitter_span == 0 {
            return exp;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_span * 2);
        (exp - jitter_span + jitter).min(self.max_ms)
    }
}

impl StateStore {
    /// Insert an action, applying the coalescing rules in one transaction.
    ///
    /// Returns the id of the surviving row — freshly inserted, or the
    /// already-pending action the enqueue collapsed into.
    pub async fn enqueue(&self, action: &Action) -> Result<i64, StoreError> {
        let target = action.target_id.to_string();
        let mut tx = self.pool.begin().await?;

        match action.action_type {
            ActionType::UpdateContent => {
                // A pending first upload will carry the latest bytes anyway.
                let superseded = sqlx::query(
                    "SELECT id FROM actions WHERE target_id = ? AND status = 'pending'
                     AND action_type IN ('update_content', 'upload') LIMIT 1",
                )
                .bind(&target)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = superseded {
                    tx.commit().await?;
                    return Ok(row.get("id"));
                }
            }
            ActionType::Upload => {
                sqlx::query(
                    "DELETE FROM actions WHERE target_id = ? AND status = 'pending'
                     AND action_type = 'update_content'",
                )
                .bind(&target)
                .execute(&mut *tx)
                .await?;
                let existing = sqlx::query(
                    "SELECT id FROM actions WHERE target_id = ? AND status = 'pending'
                     AND action_type = 'upload' LIMIT 1",
                )
                .bind(&target)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = existing {
                    tx.commit().await?;
                    return Ok(row.get("id"));
                }
            }
            ActionType::Rename | ActionType::Move => {
                let existing = sqlx::query(
                    "SELECT id FROM actions WHERE target_id = ? AND status = 'pending'
                     AND action_type IN ('rename', 'move') LIMIT 1",
                )
                .bind(&target)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = existing {
                    // Keep the final destination on the surviving row.
                    let id: i64 = row.get("id");
                    sqlx::query(
                        "UPDATE actions SET action_type = ?, destination = ?, metadata = ?
                         WHERE id = ?",
                    )
                    .bind(action.action_type.as_str())
                    .bind(&action.destination)
                    .bind(action.metadata.as_ref().map(|m| m.to_string()))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(id);
                }
            }
            ActionType::Delete => {
                sqlx::query(
                    "DELETE FROM actions WHERE target_id = ? AND status = 'pending'
                     AND action_type IN ('upload', 'update_content', 'rename', 'move')",
                )
                .bind(&target)
                .execute(&mut *tx)
                .await?;
            }
            ActionType::DownloadChunk => {
                let dup = sqlx::query(
                    "SELECT id FROM actions WHERE target_id = ?
                     AND status IN ('pending', 'processing')
                     AND action_type = 'download_chunk'
                     AND json_extract(metadata, '$.chunk_index') = ? LIMIT 1",
                )
                .bind(&target)
                .bind(i64::from(action.chunk_index().unwrap_or(0)))
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = dup {
                    tx.commit().await?;
                    return Ok(row.get("id"));
                }
            }
            ActionType::Download | ActionType::ListChildren | ActionType::EnsureLatest => {
                let dup = sqlx::query(
                    "SELECT id FROM actions WHERE target_id = ? AND status = 'pending'
                     AND action_type = ? LIMIT 1",
                )
                .bind(&target)
                .bind(action.action_type.as_str())
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = dup {
                    tx.commit().await?;
                    return Ok(row.get("id"));
                }
            }
        }

        let row = sqlx::query(
            "INSERT INTO actions (
                action_type, target_id, destination, metadata, direction,
                priority, status, retry_count, created_at, not_before
             ) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, NULL)
             RETURNING id",
        )
        .bind(action.action_type.as_str())
        .bind(&target)
        .bind(&action.destination)
        .bind(action.metadata.as_ref().map(|m| m.to_string()))
        .bind(action.direction.as_str())
        .bind(action.priority)
        .bind(action.created_at.to_rfc3339())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let id: i64 = row.get("id");
        tracing::debug!(
            action_id = id,
            action_type = action.action_type.as_str(),
            target_id = %action.target_id,
            priority = action.priority,
            "Action enqueued"
        );
        Ok(id)
    }

    /// Atomically claim the next runnable action for this worker class.
    ///
    /// Highest priority first, then earliest `created_at`; targets with an
    /// action already processing are skipped so per-target order stays FIFO.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        class: WorkerClass,
    ) -> Result<Option<Action>, StoreError> {
        let sql = format!(
            "UPDATE actions SET status = 'processing', worker_id = ?
             WHERE id = (
                SELECT id FROM actions a
                WHERE status = 'pending'
                  AND (not_before IS NULL OR not_before <= ?)
                  {}
                  AND NOT EXISTS (
                     SELECT 1 FROM actions p
                     WHERE p.target_id = a.target_id AND p.status = 'processing'
                  )
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
             )
             RETURNING *",
            class.sql_filter()
        );
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(Utc::now().to_rfc3339())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(action_from_row).transpose()
    }

    /// Mark an action completed.
    pub async fn complete_action(&self, action_id: i64) -> Result<(), StoreError> {
        crate::objects::complete_action_in(&self.pool, action_id).await
    }

    /// Record a failure: bump the retry count and reschedule with backoff,
    /// or mark the action `failed` once retries are exhausted.
    pub async fn fail_action(
        &self,
        action_id: i64,
        error: &str,
        backoff: &BackoffConfig,
    ) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT retry_count FROM actions WHERE id = ?")
            .bind(action_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        let retry_count: i64 = row.get("retry_count");
        let retry_count = retry_count as u32;

        if retry_count + 1 >= backoff.max_retries {
            sqlx::query(
                "UPDATE actions SET status = 'failed', retry_count = retry_count + 1,
                    last_error = ?, worker_id = NULL WHERE id = ?",
            )
            .bind(error)
            .bind(action_id)
            .execute(&self.pool)
            .await?;
            tracing::warn!(action_id, error, "Action failed permanently");
        } else {
            let delay = backoff.delay_ms(retry_count);
            let not_before: DateTime<Utc> =
                Utc::now() + ChronoDuration::milliseconds(delay as i64);
            sqlx::query(
                "UPDATE actions SET status = 'pending', retry_count = retry_count + 1,
                    last_error = ?, not_before = ?, worker_id = NULL WHERE id = ?",
            )
            .bind(error)
            .bind(not_before.to_rfc3339())
            .bind(action_id)
            .execute(&self.pool)
            .await?;
            tracing::debug!(action_id, delay_ms = delay, error, "Action rescheduled");
        }
        Ok(())
    }

    /// Return a claimed action to `pending` without counting a retry.
    /// Used when the engine goes offline mid-claim.
    pub async fn release_action(&self, action_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE actions SET status = 'pending', worker_id = NULL WHERE id = ?",
        )
        .bind(action_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one action row.
    pub async fn get_action(&self, action_id: i64) -> Result<Option<Action>, StoreError> {
        let row = sqlx::query("SELECT * FROM actions WHERE id = ?")
            .bind(action_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(action_from_row).transpose()
    }

    /// Pending actions for a target (tests and the control surface).
    pub async fn pending_actions_for(
        &self,
        target_id: &ObjectId,
    ) -> Result<Vec<Action>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM actions WHERE target_id = ? AND status = 'pending'
             ORDER BY priority DESC, created_at ASC",
        )
        .bind(target_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(action_from_row).collect()
    }

    /// Number of pending actions across the queue.
    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM actions WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    /// Actions surfaced as permanently failed.
    pub async fn failed_actions(&self) -> Result<Vec<Action>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM actions WHERE status = 'failed' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(action_from_row).collect()
    }

    /// Startup recovery: any action left `processing` by a dead worker goes
    /// back to `pending`. Returns the number of recovered rows.
    pub async fn recover_orphaned_actions(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE actions SET status = 'pending', worker_id = NULL
             WHERE status = 'processing'",
        )
        .execute(&self.pool)
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::info!(recovered, "Recovered orphaned actions from previous run");
        }
        Ok(recovered)
    }

    /// Drop completed rows older than `keep`. Housekeeping, not correctness.
    pub async fn prune_completed(&self, keep: ChronoDuration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - keep;
        let result = sqlx::query(
            "DELETE FROM actions WHERE status = 'completed' AND created_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
