//! `fuser::Filesystem` implementation.
//!
//! `getattr`/`readdir` are pure store reads. `open` validates and counts.
//! `read` is the only operation that may block: it enqueues the missing
//! chunks at FUSE priority and parks on the per-object condition until the
//! cache layer signals arrival or the configured timeout elapses.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use orchard_cache::{CacheStore, ChunkWaiters};
use orchard_core::config::{Config, DenylistResponse};
use orchard_core::domain::action::{PRIORITY_FUSE, PRIORITY_INTERACTIVE};
use orchard_core::domain::cache_entry::{chunk_count, chunks_for_range};
use orchard_core::domain::{
    Action, ActionType, CacheEntry, Direction, Object, ObjectId, ObjectKind, Presence, SyncState,
};
use orchard_store::{StateStore, StoreError};

use crate::denylist::ThumbnailerDenylist;
use crate::inode::InodeTable;
use crate::xattr;

/// Kernel attribute cache TTL.
const TTL: Duration = Duration::from_secs(1);

/// Tells the kernel cached file data from a previous open is still valid.
const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// FUSE-layer settings distilled from the daemon [`Config`].
#[derive(Debug, Clone)]
pub struct FuseSettings {
    pub chunk_size: u64,
    pub small_file_threshold: u64,
    pub chunk_read_timeout: Duration,
    pub denylist_response: DenylistResponse,
    pub cache_max_bytes: u64,
}

impl FuseSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size_bytes,
            small_file_threshold: config.small_file_threshold_bytes,
            chunk_read_timeout: Duration::from_millis(config.chunk_read_timeout_ms),
            denylist_response: config.thumbnailer_response,
            cache_max_bytes: config.cache_max_bytes,
        }
    }
}

/// The projected filesystem.
pub struct OrchardFs {
    rt: Handle,
    store: StateStore,
    cache: Arc<CacheStore>,
    waiters: Arc<ChunkWaiters>,
    inodes: Arc<InodeTable>,
    denylist: ThumbnailerDenylist,
    settings: FuseSettings,
    uid: u32,
    gid: u32,
}

impl OrchardFs {
    #[must_use]
    pub fn new(
        rt: Handle,
        store: StateStore,
        cache: Arc<CacheStore>,
        waiters: Arc<ChunkWaiters>,
        root_id: ObjectId,
        denylist: ThumbnailerDenylist,
        settings: FuseSettings,
    ) -> Self {
        Self {
            rt,
            store,
            cache,
            waiters,
            inodes: Arc::new(InodeTable::new(root_id)),
            denylist,
            settings,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn object_of(&self, ino: u64) -> Result<Object, libc::c_int> {
        let id = self.inodes.get(ino).ok_or(libc::ENOENT)?;
        self.rt
            .block_on(self.store.get_object(&id))
            .map_err(|_| libc::EIO)?
            .filter(|o| !o.deleted)
            .ok_or(libc::ENOENT)
    }

    fn attr_for(&self, object: &Object, ino: u64) -> FileAttr {
        let kind = if object.is_folder() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let perm = if object.is_folder() { 0o755 } else { 0o644 };
        let mtime: SystemTime = object.local_modified_at.into();
        FileAttr {
            ino,
            size: object.size,
            blocks: object.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Fetch-or-create the cache bookkeeping row for a file object.
    fn ensure_entry(&self, object: &Object) -> Result<CacheEntry, StoreError> {
        self.rt.block_on(async {
            if let Some(entry) = self.store.get_cache_entry(&object.id).await? {
                return Ok(entry);
            }
            let entry = CacheEntry::new(object.id, self.cache.path_for(&object.id), object.size);
            self.store.upsert_cache_entry(&entry).await?;
            Ok(entry)
        })
    }

    /// Block until the byte range `[offset, offset + len)` is locally
    /// servable, enqueueing the demanded content at FUSE priority.
    /// Returns false on timeout.
    fn await_range(&self, object: &Object, offset: u64, len: u64) -> Result<bool, libc::c_int> {
        let required = if object.size < self.settings.small_file_threshold {
            // Small files only ever materialize whole.
            self.rt
                .block_on(self.store.enqueue(&Action::new(
                    ActionType::Download,
                    object.id,
                    Direction::Pull,
                    PRIORITY_FUSE,
                )))
                .map_err(|_| libc::EIO)?;
            Vec::new()
        } else {
            let missing = self
                .rt
                .block_on(self.store.missing_chunks_in_range(
                    &object.id,
                    offset,
                    len,
                    object.size,
                    self.settings.chunk_size,
                ))
                .map_err(|_| libc::EIO)?;
            for index in &missing {
                self.rt
                    .block_on(
                        self.store.enqueue(
                            &Action::new(
                                ActionType::DownloadChunk,
                                object.id,
                                Direction::Pull,
                                PRIORITY_FUSE,
                            )
                            .with_metadata(serde_json::json!({ "chunk_index": index })),
                        ),
                    )
                    .map_err(|_| libc::EIO)?;
            }
            chunks_for_range(offset, len, object.size, self.settings.chunk_size)
        };

        let satisfied = || {
            let entry = self
                .rt
                .block_on(self.store.get_cache_entry(&object.id))
                .ok()
                .flatten();
            match entry.map(|e| e.presence) {
                Some(Presence::Full) => true,
                Some(Presence::Sparse) => {
                    let present = self
                        .rt
                        .block_on(self.store.chunk_indices(&object.id))
                        .unwrap_or_default();
                    required.iter().all(|i| present.contains(i))
                }
                _ => false,
            }
        };

        Ok(self
            .waiters
            .wait_until(&object.id, self.settings.chunk_read_timeout, satisfied))
    }

    fn enqueue_namespace_action(&self, object: &Object, parent_changed: bool) {
        let action = if parent_changed {
            Action::new(ActionType::Move, object.id, Direction::Push, PRIORITY_INTERACTIVE)
                .with_destination(
                    object
                        .parent_id
                        .map(|p| p.to_string())
                        .unwrap_or_default(),
                )
        } else {
            Action::new(ActionType::Rename, object.id, Direction::Push, PRIORITY_INTERACTIVE)
                .with_destination(object.full_name())
        };
        if let Err(e) = self.rt.block_on(self.store.enqueue(&action)) {
            warn!(object_id = %object.id, error = %e, "Failed to enqueue namespace action");
        }
    }

    /// Local unlink of one object: tombstone plus a queued delete push.
    fn unlink_object(&self, object: &Object) -> Result<(), libc::c_int> {
        self.rt
            .block_on(async {
                self.store
                    .mark_deleted(&object.id, SyncState::DeletedLocal)
                    .await?;
                self.store
                    .enqueue(&Action::new(
                        ActionType::Delete,
                        object.id,
                        Direction::Push,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
                Ok::<_, StoreError>(())
            })
            .map_err(|e| match e {
                StoreError::NotFound => libc::ENOENT,
                _ => libc::EIO,
            })
    }

    fn lookup_child(&self, parent_ino: u64, name: &OsStr) -> Result<Object, libc::c_int> {
        let name = name.to_str().ok_or(libc::ENOENT)?;
        let parent = self.object_of(parent_ino)?;
        let (stem, extension) = Object::split_name(name);
        self.rt
            .block_on(self.store.find_child(&parent.id, &stem, extension.as_deref()))
            .map_err(|_| libc::EIO)?
            .ok_or(libc::ENOENT)
    }
}

impl Filesystem for OrchardFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        tracing::info!("Orchard filesystem mounted");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_child(parent, name) {
            Ok(object) => {
                let ino = self.inodes.ino_for(object.id);
                reply.entry(&TTL, &self.attr_for(&object, ino), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.object_of(ino) {
            Ok(object) => reply.attr(&TTL, &self.attr_for(&object, ino)),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let folder = match self.object_of(ino) {
            Ok(o) if o.is_folder() => o,
            Ok(_) => return reply.error(libc::ENOTDIR),
            Err(errno) => return reply.error(errno),
        };

        // Never-listed folder: stale (empty) data now, listing pull soon.
        if folder.last_synced.is_none() && folder.cloud_id.is_some() {
            let _ = self.rt.block_on(self.store.enqueue(&Action::new(
                ActionType::ListChildren,
                folder.id,
                Direction::Pull,
                orchard_core::domain::action::PRIORITY_BACKGROUND,
            )));
        }

        let children = match self.rt.block_on(self.store.list_children(&folder.id)) {
            Ok(children) => children,
            Err(e) => {
                warn!(error = %e, "readdir failed");
                return reply.error(libc::EIO);
            }
        };

        let parent_ino = folder
            .parent_id
            .map(|p| self.inodes.ino_for(p))
            .unwrap_or(ino);
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in &children {
            let kind = if child.is_folder() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((self.inodes.ino_for(child.id), kind, child.full_name()));
        }

        for (i, (child_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let object = match self.object_of(ino) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };
        if object.is_folder() {
            return reply.error(libc::EISDIR);
        }
        // Validate, count the handle, return. Content is materialized
        // lazily by read; open never touches the network.
        if self.ensure_entry(&object).is_err() {
            return reply.error(libc::EIO);
        }
        if self
            .rt
            .block_on(self.store.adjust_open_count(&object.id, 1))
            .is_err()
        {
            return reply.error(libc::EIO);
        }
        reply.opened(0, FOPEN_KEEP_CACHE);
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let object = match self.object_of(ino) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };
        if object.is_folder() {
            return reply.error(libc::EISDIR);
        }
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }

        // Thumbnailer suppression comes before any materialization.
        if self.denylist.is_denied(req.pid()) {
            debug!(object_id = %object.id, pid = req.pid(), "Thumbnailer read suppressed");
            return match self.settings.denylist_response {
                DenylistResponse::ZeroFill => reply.data(&vec![0u8; size as usize]),
                DenylistResponse::IoError => reply.error(libc::EIO),
            };
        }

        let offset = offset as u64;
        if offset >= object.size {
            return reply.data(&[]);
        }
        let len = u64::from(size).min(object.size - offset);

        let entry = match self.ensure_entry(&object) {
            Ok(entry) => entry,
            Err(_) => return reply.error(libc::EIO),
        };

        let locally_servable = entry.presence == Presence::Full || object.cloud_id.is_none();
        if !locally_servable {
            match self.await_range(&object, offset, len) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(object_id = %object.id, offset, len, "Read timed out waiting for content");
                    return reply.error(libc::EIO);
                }
                Err(errno) => return reply.error(errno),
            }
        }

        match self.cache.read_range(&object.id, offset, len as usize) {
            Ok(bytes) => {
                let _ = self.rt.block_on(self.store.touch_cache_entry(&object.id));
                reply.data(&bytes);
            }
            Err(e) => {
                warn!(object_id = %object.id, error = %e, "Cache read failed");
                reply.error(libc::EIO);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let object = match self.object_of(ino) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };
        if object.is_folder() {
            return reply.error(libc::EISDIR);
        }
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let offset = offset as u64;

        let entry = match self.ensure_entry(&object) {
            Ok(entry) => entry,
            Err(_) => return reply.error(libc::EIO),
        };

        // Overwriting uncached cloud content would drop the bytes around
        // the write; hydrate the touched range first.
        if object.cloud_id.is_some() && entry.presence == Presence::Absent && object.size > 0 {
            match self.await_range(&object, offset, (data.len() as u64).max(1)) {
                Ok(true) => {}
                Ok(false) => return reply.error(libc::EIO),
                Err(errno) => return reply.error(errno),
            }
        }

        let new_len = match self.cache.write_at(&object.id, offset, data) {
            Ok(len) => len,
            Err(orchard_cache::CacheError::NoSpace) => return reply.error(libc::ENOSPC),
            Err(e) => {
                warn!(object_id = %object.id, error = %e, "Cache write failed");
                return reply.error(libc::EIO);
            }
        };

        let result = self.rt.block_on(async {
            self.store.set_object_size(&object.id, new_len).await?;
            self.store.mark_dirty(&object.id).await?;
            if entry.presence != Presence::Sparse {
                // Fresh creates and hydrated files are now fully local.
                let mut updated = entry.clone();
                updated.presence = Presence::Full;
                updated.size = new_len;
                self.store.upsert_cache_entry(&updated).await?;
            } else {
                // A write into a sparse file forces promotion: demand every
                // missing chunk now; the queued content push stays behind
                // them in per-target FIFO order until promotion completes.
                let present = self.store.chunk_indices(&object.id).await?;
                let total = chunk_count(object.size.max(new_len), self.settings.chunk_size);
                for index in (0..total).filter(|i| !present.contains(i)) {
                    self.store
                        .enqueue(
                            &Action::new(
                                ActionType::DownloadChunk,
                                object.id,
                                Direction::Pull,
                                PRIORITY_FUSE,
                            )
                            .with_metadata(serde_json::json!({ "chunk_index": index })),
                        )
                        .await?;
                }
            }
            Ok::<_, StoreError>(())
        });
        if let Err(e) = result {
            warn!(object_id = %object.id, error = %e, "Write bookkeeping failed");
            return reply.error(libc::EIO);
        }
        reply.written(data.len() as u32);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            return reply.error(libc::EINVAL);
        };
        let parent_obj = match self.object_of(parent) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };

        let result = self.rt.block_on(async {
            let object = self
                .store
                .create_local_object(&parent_obj.id, name, ObjectKind::File)
                .await?;
            // Immediately writable and fully cached.
            let mut entry = CacheEntry::new(object.id, self.cache.path_for(&object.id), 0);
            entry.presence = Presence::Full;
            entry.open_count = 1;
            self.store.upsert_cache_entry(&entry).await?;
            self.store
                .enqueue(&Action::new(
                    ActionType::Upload,
                    object.id,
                    Direction::Push,
                    PRIORITY_INTERACTIVE,
                ))
                .await?;
            Ok::<_, StoreError>(object)
        });

        match result {
            Ok(object) => {
                if let Err(e) = self.cache.truncate(&object.id, 0) {
                    warn!(object_id = %object.id, error = %e, "Failed to create cache file");
                    return reply.error(libc::EIO);
                }
                let ino = self.inodes.ino_for(object.id);
                reply.created(&TTL, &self.attr_for(&object, ino), 0, 0, FOPEN_KEEP_CACHE);
            }
            Err(StoreError::Domain(orchard_core::domain::DomainError::AlreadyExists(_))) => {
                reply.error(libc::EEXIST)
            }
            Err(StoreError::Domain(_)) => reply.error(libc::EINVAL),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            return reply.error(libc::EINVAL);
        };
        let parent_obj = match self.object_of(parent) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };

        let result = self.rt.block_on(async {
            let object = self
                .store
                .create_local_object(&parent_obj.id, name, ObjectKind::Folder)
                .await?;
            self.store
                .enqueue(&Action::new(
                    ActionType::Upload,
                    object.id,
                    Direction::Push,
                    PRIORITY_INTERACTIVE,
                ))
                .await?;
            Ok::<_, StoreError>(object)
        });

        match result {
            Ok(object) => {
                let ino = self.inodes.ino_for(object.id);
                reply.entry(&TTL, &self.attr_for(&object, ino), 0);
            }
            Err(StoreError::Domain(orchard_core::domain::DomainError::AlreadyExists(_))) => {
                reply.error(libc::EEXIST)
            }
            Err(StoreError::Domain(_)) => reply.error(libc::EINVAL),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let object = match self.lookup_child(parent, name) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };
        if object.is_folder() {
            return reply.error(libc::EISDIR);
        }
        match self.unlink_object(&object) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let object = match self.lookup_child(parent, name) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };
        if !object.is_folder() {
            return reply.error(libc::ENOTDIR);
        }
        let children = match self.rt.block_on(self.store.list_children(&object.id)) {
            Ok(children) => children,
            Err(_) => return reply.error(libc::EIO),
        };
        if !children.is_empty() {
            return reply.error(libc::ENOTEMPTY);
        }
        match self.unlink_object(&object) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let Some(newname) = newname.to_str() else {
            return reply.error(libc::EINVAL);
        };
        let object = match self.lookup_child(parent, name) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };
        let new_parent_obj = match self.object_of(newparent) {
            Ok(o) if o.is_folder() => o,
            Ok(_) => return reply.error(libc::ENOTDIR),
            Err(errno) => return reply.error(errno),
        };

        // POSIX rename replaces an existing destination.
        if let Ok(existing) = self.lookup_child(newparent, OsStr::new(newname)) {
            if existing.id != object.id {
                if existing.is_folder() {
                    let children = self
                        .rt
                        .block_on(self.store.list_children(&existing.id))
                        .unwrap_or_default();
                    if !children.is_empty() {
                        return reply.error(libc::ENOTEMPTY);
                    }
                }
                if let Err(errno) = self.unlink_object(&existing) {
                    return reply.error(errno);
                }
            }
        }

        let parent_changed = object.parent_id != Some(new_parent_obj.id);
        match self
            .rt
            .block_on(self.store.rename_object(&object.id, &new_parent_obj.id, newname))
        {
            Ok(renamed) => {
                self.enqueue_namespace_action(&renamed, parent_changed);
                reply.ok();
            }
            Err(StoreError::Domain(orchard_core::domain::DomainError::AlreadyExists(_))) => {
                reply.error(libc::EEXIST)
            }
            Err(StoreError::NotFound) => reply.error(libc::ENOENT),
            Err(_) => reply.error(libc::EIO),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let object = match self.object_of(ino) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };

        if let Some(new_size) = size {
            if object.is_folder() {
                return reply.error(libc::EISDIR);
            }
            if let Err(e) = self.cache.truncate(&object.id, new_size) {
                warn!(object_id = %object.id, error = %e, "Truncate failed");
                return reply.error(libc::EIO);
            }
            let result = self.rt.block_on(async {
                self.store.set_object_size(&object.id, new_size).await?;
                self.store.mark_dirty(&object.id).await?;
                // Chunk rows past the new end are no longer meaningful.
                let keep = chunk_count(new_size, self.settings.chunk_size);
                let stale: Vec<u32> = self
                    .store
                    .chunk_indices(&object.id)
                    .await?
                    .into_iter()
                    .filter(|i| *i >= keep)
                    .collect();
                if !stale.is_empty() {
                    self.store.remove_chunks(&object.id, &stale).await?;
                }
                Ok::<_, StoreError>(())
            });
            if result.is_err() {
                return reply.error(libc::EIO);
            }
        }

        match self.object_of(ino) {
            Ok(refreshed) => reply.attr(&TTL, &self.attr_for(&refreshed, ino)),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(id) = self.inodes.get(ino) else {
            return reply.ok();
        };
        let result = self.rt.block_on(async {
            let open_count = self.store.adjust_open_count(&id, -1).await.unwrap_or(0);
            let Some(object) = self.store.get_object(&id).await? else {
                return Ok(());
            };

            if object.deleted && object.sync_state == SyncState::DeletedCloud && open_count == 0 {
                // Deferred teardown of a remotely deleted, formerly open file.
                let _ = self.cache.remove(&id);
                self.store.delete_cache_entry(&id).await?;
                return Ok(());
            }

            if object.dirty || object.sync_state == SyncState::PendingPush {
                // Coalesced content push; a sparse entry's pending chunk
                // fetches outrank it, deferring the upload until promotion.
                self.store
                    .enqueue(&Action::new(
                        ActionType::UpdateContent,
                        id,
                        Direction::Push,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
            }
            Ok::<_, StoreError>(())
        });
        if let Err(e) = result {
            warn!(object_id = %id, error = %e, "Release bookkeeping failed");
        }
        if object_was_purged(&self.rt, &self.store, &id) {
            self.inodes.forget(&id);
            self.waiters.forget(&id);
        }
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let object = match self.object_of(ino) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };
        let Some(name) = name.to_str() else {
            return reply.error(libc::ENODATA);
        };
        let entry = self
            .rt
            .block_on(self.store.get_cache_entry(&object.id))
            .ok()
            .flatten();

        match xattr::get(&object, entry.as_ref(), name) {
            Some(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            None => reply.error(libc::ENODATA),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        if self.object_of(ino).is_err() {
            return reply.error(libc::ENOENT);
        }
        let mut data = Vec::new();
        for name in xattr::list_names() {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        if size == 0 {
            reply.size(data.len() as u32);
        } else if data.len() <= size as usize {
            reply.data(&data);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let object = match self.object_of(ino) {
            Ok(o) => o,
            Err(errno) => return reply.error(errno),
        };
        if name.to_str() != Some(xattr::XATTR_PIN) {
            return reply.error(libc::ENOTSUP);
        }
        let Some(pin) = xattr::parse_pin_value(value) else {
            return reply.error(libc::EINVAL);
        };

        let result = self.rt.block_on(async {
            if self.store.get_cache_entry(&object.id).await?.is_none() {
                let entry = CacheEntry::new(object.id, self.cache.path_for(&object.id), object.size);
                self.store.upsert_cache_entry(&entry).await?;
            }
            self.store.set_pinned(&object.id, pin).await?;
            if pin {
                // Pinned means fully cached: demand the content now.
                self.store
                    .enqueue(&Action::new(
                        ActionType::Download,
                        object.id,
                        Direction::Pull,
                        PRIORITY_INTERACTIVE,
                    ))
                    .await?;
            }
            Ok::<_, StoreError>(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        const BLOCK_SIZE: u32 = 4096;
        let total_blocks = self.settings.cache_max_bytes / u64::from(BLOCK_SIZE);
        let used_bytes = self.cache.disk_usage().unwrap_or(0);
        let used_blocks = used_bytes / u64::from(BLOCK_SIZE);
        let free_blocks = total_blocks.saturating_sub(used_blocks);
        reply.statfs(
            total_blocks,
            free_blocks,
            free_blocks,
            0,
            0,
            BLOCK_SIZE,
            255,
            BLOCK_SIZE,
        );
    }
}

/// True when the object row no longer exists (purged tombstone).
fn object_was_purged(rt: &Handle, store: &StateStore, id: &ObjectId) -> bool {
    matches!(rt.block_on(store.get_object(id)), Ok(None))
}
