//! Route handlers: store queries and engine toggles behind JSON responses.

use std::collections::HashMap;
use std::str::FromStr;

use serde::Serialize;

use orchard_core::domain::action::PRIORITY_INTERACTIVE;
use orchard_core::domain::{Action, ActionType, Direction, ObjectId, SyncState};
use orchard_store::{StateStore, StoreError};
use orchard_sync::Connectivity;

/// Daemon status snapshot served by `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub objects_by_state: HashMap<String, u64>,
    pub pending_actions: u64,
    pub failed_actions: u64,
    pub online: bool,
    pub paused: bool,
    pub auth_failed: bool,
}

/// Which side wins a manual resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveChoice {
    Local,
    Remote,
}

impl FromStr for ResolveChoice {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ResolveChoice::Local),
            "remote" => Ok(ResolveChoice::Remote),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ConflictEntry {
    pub id: String,
    pub name: String,
    pub cloud_id: Option<String>,
    pub conflict_history: Option<String>,
}

pub(crate) async fn status(
    store: &StateStore,
    connectivity: &Connectivity,
) -> Result<StatusReport, StoreError> {
    Ok(StatusReport {
        objects_by_state: store.counts_by_state().await?,
        pending_actions: store.pending_count().await?,
        failed_actions: store.failed_actions().await?.len() as u64,
        online: connectivity.is_online(),
        paused: connectivity.is_paused(),
        auth_failed: connectivity.is_auth_failed(),
    })
}

pub(crate) async fn conflicts(store: &StateStore) -> Result<Vec<ConflictEntry>, StoreError> {
    Ok(store
        .list_conflicts()
        .await?
        .into_iter()
        .map(|o| ConflictEntry {
            id: o.id.to_string(),
            name: o.full_name(),
            cloud_id: o.cloud_id.as_ref().map(|c| c.as_str().to_string()),
            conflict_history: o.conflict_history.clone(),
        })
        .collect())
}

/// Resolve a surfaced conflict: the chosen side's state is scheduled and
/// the object leaves `conflict`.
pub(crate) async fn resolve(
    store: &StateStore,
    id: &ObjectId,
    choice: ResolveChoice,
) -> Result<(), StoreError> {
    let object = store.get_object(id).await?.ok_or(StoreError::NotFound)?;
    if object.sync_state != SyncState::Conflict {
        return Err(StoreError::NotFound);
    }
    match choice {
        ResolveChoice::Local => {
            store.set_sync_state(id, SyncState::PendingPush).await?;
            store
                .enqueue(&Action::new(
                    ActionType::UpdateContent,
                    *id,
                    Direction::Push,
                    PRIORITY_INTERACTIVE,
                ))
                .await?;
        }
        ResolveChoice::Remote => {
            store.set_sync_state(id, SyncState::PendingPull).await?;
            store
                .enqueue(&Action::new(
                    ActionType::Download,
                    *id,
                    Direction::Pull,
                    PRIORITY_INTERACTIVE,
                ))
                .await?;
        }
    }
    tracing::info!(object_id = %id, choice = ?choice, "Conflict resolved via control API");
    Ok(())
}

/// Pin an object and demand its content.
pub(crate) async fn pin(store: &StateStore, id: &ObjectId) -> Result<(), StoreError> {
    let object = store.get_object(id).await?.ok_or(StoreError::NotFound)?;
    if store.get_cache_entry(id).await?.is_none() {
        let entry = orchard_core::domain::CacheEntry::new(
            *id,
            std::path::PathBuf::new(),
            object.size,
        );
        store.upsert_cache_entry(&entry).await?;
    }
    store.set_pinned(id, true).await?;
    store
        .enqueue(&Action::new(
            ActionType::Download,
            *id,
            Direction::Pull,
            PRIORITY_INTERACTIVE,
        ))
        .await?;
    Ok(())
}
