//! Bidirectional inode ↔ object-id mapping.
//!
//! Inodes are minted on first lookup and stay stable for the session; the
//! object ID is the durable identity. Inode 1 is always the root.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use orchard_core::domain::ObjectId;

/// The root inode number mandated by FUSE.
pub const ROOT_INO: u64 = 1;

/// Session-scoped inode table.
pub struct InodeTable {
    by_ino: DashMap<u64, ObjectId>,
    by_object: DashMap<ObjectId, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    /// Table with the root object pre-bound to inode 1.
    #[must_use]
    pub fn new(root: ObjectId) -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_object: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        };
        table.by_ino.insert(ROOT_INO, root);
        table.by_object.insert(root, ROOT_INO);
        table
    }

    /// Resolve an inode to its object ID.
    #[must_use]
    pub fn get(&self, ino: u64) -> Option<ObjectId> {
        self.by_ino.get(&ino).map(|r| *r)
    }

    /// The inode for an object, minting one on first sight.
    pub fn ino_for(&self, object_id: ObjectId) -> u64 {
        if let Some(ino) = self.by_object.get(&object_id) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.by_object.insert(object_id, ino);
        self.by_ino.insert(ino, object_id);
        ino
    }

    /// Drop a mapping once the object is purged.
    pub fn forget(&self, object_id: &ObjectId) {
        if let Some((_, ino)) = self.by_object.remove(object_id) {
            self.by_ino.remove(&ino);
        }
    }
}
