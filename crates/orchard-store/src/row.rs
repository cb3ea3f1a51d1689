//! Row-to-domain mapping helpers.
//!
//! ## Type Mapping
//!
//! | Domain Type       | SQL Type | Strategy                                 |
//! |-------------------|----------|------------------------------------------|
//! | ObjectId          | TEXT     | UUID string via `to_string` / `FromStr`  |
//! | CloudId, Etag,    | TEXT     | plain string via `as_str` / `new`        |
//! | Revision, FileHash|          |                                          |
//! | DateTime<Utc>     | TEXT     | RFC 3339 via `to_rfc3339` / parse        |
//! | SyncState         | TEXT     | `name()`; Error variant as `error:<msg>` |
//! | Presence          | INTEGER  | 0 / 1 / 2                                |
//! | Action metadata   | TEXT     | serde_json                               |

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use orchard_core::domain::{
    Action, ActionStatus, ActionType, CacheEntry, Chunk, CloudId, Direction, Etag, FileHash,
    Object, ObjectId, ObjectKind, Origin, Presence, Revision, Shadow, SyncState,
};

use crate::StoreError;

// ============================================================================
// Scalar conversions
// ============================================================================

pub(crate) fn sync_state_to_string(state: &SyncState) -> String {
    match state {
        SyncState::Error(msg) => format!("error:{}", msg),
        other => other.name().to_string(),
    }
}

pub(crate) fn sync_state_from_string(s: &str) -> Result<SyncState, StoreError> {
    match s {
        "synced" => Ok(SyncState::Synced),
        "dirty" => Ok(SyncState::Dirty),
        "pending_push" => Ok(SyncState::PendingPush),
        "pending_pull" => Ok(SyncState::PendingPull),
        "conflict" => Ok(SyncState::Conflict),
        "deleted_local" => Ok(SyncState::DeletedLocal),
        "deleted_cloud" => Ok(SyncState::DeletedCloud),
        s if s.starts_with("error:") => Ok(SyncState::Error(s[6..].to_string())),
        other => Err(StoreError::Decode(format!("Unknown sync state: {}", other))),
    }
}

pub(crate) fn kind_from_string(s: &str) -> Result<ObjectKind, StoreError> {
    match s {
        "file" => Ok(ObjectKind::File),
        "folder" => Ok(ObjectKind::Folder),
        other => Err(StoreError::Decode(format!("Unknown object kind: {}", other))),
    }
}

pub(crate) fn origin_from_string(s: &str) -> Result<Origin, StoreError> {
    match s {
        "local" => Ok(Origin::Local),
        "cloud" => Ok(Origin::Cloud),
        other => Err(StoreError::Decode(format!("Unknown origin: {}", other))),
    }
}

pub(crate) fn action_type_from_string(s: &str) -> Result<ActionType, StoreError> {
    match s {
        "upload" => Ok(ActionType::Upload),
        "download" => Ok(ActionType::Download),
        "download_chunk" => Ok(ActionType::DownloadChunk),
        "update_content" => Ok(ActionType::UpdateContent),
        "rename" => Ok(ActionType::Rename),
        "move" => Ok(ActionType::Move),
        "delete" => Ok(ActionType::Delete),
        "list_children" => Ok(ActionType::ListChildren),
        "ensure_latest" => Ok(ActionType::EnsureLatest),
        other => Err(StoreError::Decode(format!("Unknown action type: {}", other))),
    }
}

pub(crate) fn action_status_from_string(s: &str) -> Result<ActionStatus, StoreError> {
    match s {
        "pending" => Ok(ActionStatus::Pending),
        "processing" => Ok(ActionStatus::Processing),
        "failed" => Ok(ActionStatus::Failed),
        "completed" => Ok(ActionStatus::Completed),
        other => Err(StoreError::Decode(format!("Unknown action status: {}", other))),
    }
}

pub(crate) fn direction_from_string(s: &str) -> Result<Direction, StoreError> {
    match s {
        "push" => Ok(Direction::Push),
        "pull" => Ok(Direction::Pull),
        other => Err(StoreError::Decode(format!("Unknown direction: {}", other))),
    }
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("Failed to parse datetime '{}': {}", s, e)))
}

pub(crate) fn parse_optional_datetime(
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

fn object_id(s: &str) -> Result<ObjectId, StoreError> {
    ObjectId::from_str(s).map_err(|e| StoreError::Decode(e.to_string()))
}

fn optional_cloud_id(s: Option<String>) -> Result<Option<CloudId>, StoreError> {
    s.map(|v| CloudId::new(v).map_err(|e| StoreError::Decode(e.to_string())))
        .transpose()
}

fn optional_etag(s: Option<String>) -> Result<Option<Etag>, StoreError> {
    s.map(|v| Etag::new(v).map_err(|e| StoreError::Decode(e.to_string())))
        .transpose()
}

fn optional_revision(s: Option<String>) -> Result<Option<Revision>, StoreError> {
    s.map(|v| Revision::new(v).map_err(|e| StoreError::Decode(e.to_string())))
        .transpose()
}

fn optional_hash(s: Option<String>) -> Result<Option<FileHash>, StoreError> {
    s.map(|v| FileHash::new(v).map_err(|e| StoreError::Decode(e.to_string())))
        .transpose()
}

// ============================================================================
// Row mapping
// ============================================================================

pub(crate) fn object_from_row(row: &SqliteRow) -> Result<Object, StoreError> {
    let id: String = row.get("id");
    let cloud_id: Option<String> = row.get("cloud_id");
    let kind: String = row.get("kind");
    let parent_id: Option<String> = row.get("parent_id");
    let size: i64 = row.get("size");
    let local_modified_at: String = row.get("local_modified_at");
    let cloud_modified_at: Option<String> = row.get("cloud_modified_at");
    let etag: Option<String> = row.get("etag");
    let revision: Option<String> = row.get("revision");
    let origin: String = row.get("origin");
    let sync_state: String = row.get("sync_state");
    let dirty: i64 = row.get("dirty");
    let deleted: i64 = row.get("deleted");
    let missing: i64 = row.get("missing_from_cloud");
    let last_synced: Option<String> = row.get("last_synced");
    let content_hash: Option<String> = row.get("content_hash");

    Ok(Object {
        id: object_id(&id)?,
        cloud_id: optional_cloud_id(cloud_id)?,
        kind: kind_from_string(&kind)?,
        parent_id: parent_id.as_deref().map(object_id).transpose()?,
        name: row.get("name"),
        extension: row.get("extension"),
        size: size as u64,
        local_modified_at: parse_datetime(&local_modified_at)?,
        cloud_modified_at: parse_optional_datetime(cloud_modified_at)?,
        etag: optional_etag(etag)?,
        revision: optional_revision(revision)?,
        origin: origin_from_string(&origin)?,
        sync_state: sync_state_from_string(&sync_state)?,
        dirty: dirty != 0,
        deleted: deleted != 0,
        missing_from_cloud: missing != 0,
        last_synced: parse_optional_datetime(last_synced)?,
        content_hash: optional_hash(content_hash)?,
        conflict_history: row.get("conflict_history"),
    })
}

pub(crate) fn shadow_from_row(row: &SqliteRow) -> Result<Shadow, StoreError> {
    let object_id_str: String = row.get("object_id");
    let cloud_id: String = row.get("cloud_id");
    let parent_cloud_id: Option<String> = row.get("parent_cloud_id");
    let etag: String = row.get("etag");
    let file_hash: Option<String> = row.get("file_hash");
    let modified_at: String = row.get("modified_at");
    let observed_at: String = row.get("observed_at");

    Ok(Shadow {
        object_id: object_id(&object_id_str)?,
        cloud_id: CloudId::new(cloud_id).map_err(|e| StoreError::Decode(e.to_string()))?,
        parent_cloud_id: optional_cloud_id(parent_cloud_id)?,
        name: row.get("name"),
        etag: Etag::new(etag).map_err(|e| StoreError::Decode(e.to_string()))?,
        file_hash: optional_hash(file_hash)?,
        modified_at: parse_datetime(&modified_at)?,
        observed_at: parse_datetime(&observed_at)?,
    })
}

pub(crate) fn cache_entry_from_row(row: &SqliteRow) -> Result<CacheEntry, StoreError> {
    let object_id_str: String = row.get("object_id");
    let local_path: String = row.get("local_path");
    let size: i64 = row.get("size");
    let file_hash: Option<String> = row.get("file_hash");
    let present: i64 = row.get("present_locally");
    let pinned: i64 = row.get("pinned");
    let last_accessed: String = row.get("last_accessed");
    let open_count: i64 = row.get("open_count");

    Ok(CacheEntry {
        object_id: object_id(&object_id_str)?,
        local_path: PathBuf::from(local_path),
        size: size as u64,
        file_hash: optional_hash(file_hash)?,
        presence: Presence::from_i64(present)
            .ok_or_else(|| StoreError::Decode(format!("Unknown presence: {}", present)))?,
        pinned: pinned != 0,
        last_accessed: parse_datetime(&last_accessed)?,
        open_count: open_count as u32,
    })
}

pub(crate) fn chunk_from_row(row: &SqliteRow) -> Result<Chunk, StoreError> {
    let object_id_str: String = row.get("object_id");
    let chunk_index: i64 = row.get("chunk_index");
    let last_accessed: String = row.get("last_accessed");

    Ok(Chunk {
        object_id: object_id(&object_id_str)?,
        chunk_index: chunk_index as u32,
        last_accessed: parse_datetime(&last_accessed)?,
    })
}

pub(crate) fn action_from_row(row: &SqliteRow) -> Result<Action, StoreError> {
    let id: i64 = row.get("id");
    let action_type: String = row.get("action_type");
    let target_id: String = row.get("target_id");
    let metadata: Option<String> = row.get("metadata");
    let direction: String = row.get("direction");
    let priority: i64 = row.get("priority");
    let status: String = row.get("status");
    let retry_count: i64 = row.get("retry_count");
    let created_at: String = row.get("created_at");
    let not_before: Option<String> = row.get("not_before");

    let metadata = match metadata {
        Some(ref s) if !s.is_empty() => Some(
            serde_json::from_str(s)
                .map_err(|e| StoreError::Decode(format!("Invalid action metadata: {}", e)))?,
        ),
        _ => None,
    };

    Ok(Action {
        id,
        action_type: action_type_from_string(&action_type)?,
        target_id: object_id(&target_id)?,
        destination: row.get("destination"),
        metadata,
        direction: direction_from_string(&direction)?,
        priority: priority as i32,
        status: action_status_from_string(&status)?,
        retry_count: retry_count as u32,
        last_error: row.get("last_error"),
        created_at: parse_datetime(&created_at)?,
        not_before: parse_optional_datetime(not_before)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_string_roundtrip() {
        let states = [
            SyncState::Synced,
            SyncState::Dirty,
            SyncState::PendingPush,
            SyncState::PendingPull,
            SyncState::Conflict,
            SyncState::DeletedLocal,
            SyncState::DeletedCloud,
            SyncState::Error("disk on fire".to_string()),
        ];
        for state in states {
            let s = sync_state_to_string(&state);
            assert_eq!(sync_state_from_string(&s).unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_strings_rejected() {
        assert!(sync_state_from_string("frobnicated").is_err());
        assert!(kind_from_string("symlink").is_err());
        assert!(action_type_from_string("teleport").is_err());
        assert!(direction_from_string("sideways").is_err());
    }

    #[test]
    fn test_datetime_parse() {
        let now = Utc::now();
        let parsed = parse_datetime(&now.to_rfc3339()).unwrap();
        assert_eq!(parsed, now);
        assert!(parse_datetime("yesterday-ish").is_err());
        assert_eq!(parse_optional_datetime(None).unwrap(), None);
        assert_eq!(parse_optional_datetime(Some(String::new())).unwrap(), None);
    }
}
