//! Queued actions — durable intents processed by the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::newtypes::ObjectId;

/// Priority for FUSE-synchronous needs (a blocked `read`).
pub const PRIORITY_FUSE: i32 = 10;
/// Priority for user-interactive work (pins, explicit sync).
pub const PRIORITY_INTERACTIVE: i32 = 5;
/// Priority for background metadata (folder listings, reconciliation).
pub const PRIORITY_BACKGROUND: i32 = 1;

/// The kind of work an action requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// First push of a locally created object.
    Upload,
    /// Full-file pull for small files.
    Download,
    /// Range pull of one 8 MiB block of a sparse file.
    DownloadChunk,
    /// Content push for an already-bound object, conditional on the shadow.
    UpdateContent,
    Rename,
    Move,
    Delete,
    /// Single-level folder listing pull.
    ListChildren,
    /// Metadata-only reconcile that schedules a push or pull.
    EnsureLatest,
}

impl ActionType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Upload => "upload",
            ActionType::Download => "download",
            ActionType::DownloadChunk => "download_chunk",
            ActionType::UpdateContent => "update_content",
            ActionType::Rename => "rename",
            ActionType::Move => "move",
            ActionType::Delete => "delete",
            ActionType::ListChildren => "list_children",
            ActionType::EnsureLatest => "ensure_latest",
        }
    }

    /// Short, latency-sensitive operations handled by the metadata worker.
    #[must_use]
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            ActionType::ListChildren
                | ActionType::Rename
                | ActionType::Move
                | ActionType::EnsureLatest
        )
    }

    /// Actions that push local intent toward the remote.
    #[must_use]
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            ActionType::Upload
                | ActionType::UpdateContent
                | ActionType::Rename
                | ActionType::Move
                | ActionType::Delete
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which way the action moves state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Push,
    Pull,
}

impl Direction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }
}

/// Queue status of an action row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

impl ActionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Processing => "processing",
            ActionStatus::Failed => "failed",
            ActionStatus::Completed => "completed",
        }
    }
}

/// A durable queued intent.
///
/// Rows live in the state store's `actions` table; coalescing happens at
/// enqueue time under the inserting transaction (see `orchard-store`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Row id; 0 until inserted.
    pub id: i64,
    pub action_type: ActionType,
    pub target_id: ObjectId,
    /// Destination name for renames, destination parent for moves.
    pub destination: Option<String>,
    /// Free-form payload; e.g. `{"chunk_index": 3}` for `DownloadChunk`.
    pub metadata: Option<serde_json::Value>,
    pub direction: Direction,
    /// Higher runs first; ties broken by `created_at` ascending.
    pub priority: i32,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest time a retried action may be claimed again.
    pub not_before: Option<DateTime<Utc>>,
}

impl Action {
    /// A new pending action with the given type, target and priority.
    #[must_use]
    pub fn new(
        action_type: ActionType,
        target_id: ObjectId,
        direction: Direction,
        priority: i32,
    ) -> Self {
        Self {
            id: 0,
            action_type,
            target_id,
            destination: None,
            metadata: None,
            direction,
            priority,
            status: ActionStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            not_before: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The chunk index carried by a `DownloadChunk` action, if present.
    #[must_use]
    pub fn chunk_index(&self) -> Option<u32> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("chunk_index"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    }
}
