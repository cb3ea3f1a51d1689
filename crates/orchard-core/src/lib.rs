//! Core domain model for Orchard.
//!
//! Orchard projects a remote object store (Apple iCloud Drive) as a local
//! filesystem. This crate holds the pieces every other crate agrees on:
//!
//! - [`domain`] — entities (objects, shadows, actions, cache entries), the
//!   sync-state machine, and validated newtypes
//! - [`ports`] — the [`ports::RemoteAdapter`] capability trait the sync
//!   engine is generic over
//! - [`config`] — typed configuration loaded from
//!   `~/.config/orchard/config.json`
//!
//! No I/O happens here; persistence lives in `orchard-store`, content in
//! `orchard-cache`, and network effects behind the remote adapter.

pub mod config;
pub mod domain;
pub mod ports;

pub use domain::{
    action::{Action, ActionStatus, ActionType, Direction},
    cache_entry::{CacheEntry, Presence},
    errors::DomainError,
    newtypes::{CloudId, Etag, FileHash, ObjectId, Revision},
    object::{Object, ObjectKind, Origin, SyncState},
    shadow::Shadow,
};
