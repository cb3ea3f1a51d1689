//! Extended attributes exposed on projected files.
//!
//! - `user.orchard.status` — sync status string
//! - `user.orchard.pin` — `0`/`1`; writing pins or unpins
//! - `user.xdg.emblems` — comma-separated emblem names for file managers

use orchard_core::domain::{CacheEntry, Object, Presence, SyncState};

/// Sync status attribute name.
pub const XATTR_STATUS: &str = "user.orchard.status";
/// Pin request/read attribute name.
pub const XATTR_PIN: &str = "user.orchard.pin";
/// Freedesktop emblem attribute name.
pub const XATTR_EMBLEMS: &str = "user.xdg.emblems";

/// All attribute names, for `listxattr`.
#[must_use]
pub fn list_names() -> Vec<&'static str> {
    vec![XATTR_STATUS, XATTR_PIN, XATTR_EMBLEMS]
}

/// The status string exposed for an object given its cache presence.
///
/// `cloud` and `partial` refine `synced` by materialization: content absent
/// entirely, or sparse with some chunks missing.
#[must_use]
pub fn status_of(object: &Object, entry: Option<&CacheEntry>) -> &'static str {
    match &object.sync_state {
        SyncState::Synced => match entry.map(|e| e.presence) {
            Some(Presence::Full) => "synced",
            Some(Presence::Sparse) => "partial",
            Some(Presence::Absent) | None => {
                if object.is_folder() {
                    "synced"
                } else {
                    "cloud"
                }
            }
        },
        SyncState::Dirty => "dirty",
        SyncState::PendingPush => "pending_push",
        SyncState::PendingPull => "pending_pull",
        SyncState::Conflict => "conflict",
        SyncState::Error(_) => "error",
        SyncState::DeletedLocal | SyncState::DeletedCloud => "error",
    }
}

/// Emblems derived from the status string.
#[must_use]
pub fn emblems_for(status: &str) -> &'static str {
    match status {
        "synced" => "emblem-default",
        "dirty" | "pending_push" | "pending_pull" => "emblem-synchronizing",
        "conflict" | "error" => "emblem-important",
        "cloud" => "emblem-web",
        "partial" => "emblem-web,emblem-synchronizing",
        _ => "",
    }
}

/// Read an attribute's value, if this entry has one.
#[must_use]
pub fn get(object: &Object, entry: Option<&CacheEntry>, name: &str) -> Option<Vec<u8>> {
    match name {
        XATTR_STATUS => Some(status_of(object, entry).as_bytes().to_vec()),
        XATTR_PIN => {
            let pinned = entry.is_some_and(|e| e.pinned);
            Some(if pinned { b"1".to_vec() } else { b"0".to_vec() })
        }
        XATTR_EMBLEMS => Some(emblems_for(status_of(object, entry)).as_bytes().to_vec()),
        _ => None,
    }
}

/// Parse a pin-attribute write. `Some(true)` pins, `Some(false)` unpins.
#[must_use]
pub fn parse_pin_value(value: &[u8]) -> Option<bool> {
    match std::str::from_utf8(value).ok()?.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}
