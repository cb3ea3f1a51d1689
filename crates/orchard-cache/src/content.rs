//! Byte-level cache file operations.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use orchard_core::domain::{FileHash, ObjectId};

use crate::CacheError;

/// Manages cached content on disk.
///
/// Layout under the cache root:
///
/// ```text
/// {root}/objects/{object_id}        final content (full or sparse)
/// {root}/objects/{object_id}.part   in-progress full download
/// {root}/staging/{remote_name}      transient upload symlinks
/// ```
pub struct CacheStore {
    objects_dir: PathBuf,
    staging_dir: PathBuf,
}

impl CacheStore {
    /// Open the cache root, creating its directories if needed.
    pub fn new(cache_root: &Path) -> std::io::Result<Self> {
        let objects_dir = cache_root.join("objects");
        let staging_dir = cache_root.join("staging");
        fs::create_dir_all(&objects_dir)?;
        fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            objects_dir,
            staging_dir,
        })
    }

    /// Final content path for an object.
    #[must_use]
    pub fn path_for(&self, id: &ObjectId) -> PathBuf {
        self.objects_dir.join(id.to_string())
    }

    /// In-progress download path (`.part` suffix is reserved).
    #[must_use]
    pub fn part_path_for(&self, id: &ObjectId) -> PathBuf {
        self.objects_dir.join(format!("{}.part", id))
    }

    #[must_use]
    pub fn exists(&self, id: &ObjectId) -> bool {
        self.path_for(id).exists()
    }

    // ========================================================================
    // Reservation and sparse writes
    // ========================================================================

    /// Ensure the backing file exists and is truncated to `size`.
    ///
    /// The truncation is sparse: no data blocks are allocated until chunks
    /// are written. Called before every chunk write.
    pub fn reserve(&self, id: &ObjectId, size: u64) -> Result<(), CacheError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path_for(id))
            .map_err(CacheError::from_io)?;
        if file.metadata().map_err(CacheError::from_io)?.len() != size {
            file.set_len(size).map_err(CacheError::from_io)?;
        }
        Ok(())
    }

    /// Write one chunk's bytes at its aligned offset.
    pub fn write_chunk(&self, id: &ObjectId, offset: u64, data: &[u8]) -> Result<(), CacheError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.path_for(id))
            .map_err(CacheError::from_io)?;
        file.seek(SeekFrom::Start(offset)).map_err(CacheError::from_io)?;
        file.write_all(data).map_err(CacheError::from_io)?;
        Ok(())
    }

    /// Write local bytes at an arbitrary offset (FUSE `write` path),
    /// extending the file if needed. Returns the new logical size.
    pub fn write_at(&self, id: &ObjectId, offset: u64, data: &[u8]) -> Result<u64, CacheError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path_for(id))
            .map_err(CacheError::from_io)?;
        file.seek(SeekFrom::Start(offset)).map_err(CacheError::from_io)?;
        file.write_all(data).map_err(CacheError::from_io)?;
        Ok(file.metadata().map_err(CacheError::from_io)?.len())
    }

    /// Read up to `len` bytes at `offset`. Short reads at EOF truncate the
    /// buffer rather than erroring.
    pub fn read_range(&self, id: &ObjectId, offset: u64, len: usize) -> Result<Vec<u8>, CacheError> {
        let mut file = File::open(self.path_for(id)).map_err(CacheError::from_io)?;
        file.seek(SeekFrom::Start(offset)).map_err(CacheError::from_io)?;
        let mut buffer = vec![0u8; len];
        let mut read = 0;
        while read < len {
            match file.read(&mut buffer[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) => return Err(CacheError::from_io(e)),
            }
        }
        buffer.truncate(read);
        Ok(buffer)
    }

    /// Truncate the backing file (FUSE `truncate` path).
    pub fn truncate(&self, id: &ObjectId, size: u64) -> Result<(), CacheError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path_for(id))
            .map_err(CacheError::from_io)?;
        file.set_len(size).map_err(CacheError::from_io)?;
        Ok(())
    }

    // ========================================================================
    // Full downloads
    // ========================================================================

    /// Write a full download to the `.part` path.
    pub fn write_part(&self, id: &ObjectId, data: &[u8]) -> Result<(), CacheError> {
        let mut file = File::create(self.part_path_for(id)).map_err(CacheError::from_io)?;
        file.write_all(data).map_err(CacheError::from_io)?;
        file.sync_all().map_err(CacheError::from_io)?;
        Ok(())
    }

    /// Atomically swap a completed `.part` into place.
    pub fn commit_part(&self, id: &ObjectId) -> Result<(), CacheError> {
        fs::rename(self.part_path_for(id), self.path_for(id)).map_err(CacheError::from_io)?;
        Ok(())
    }

    /// Remove the object's content and any leftover `.part`.
    pub fn remove(&self, id: &ObjectId) -> Result<(), CacheError> {
        let path = self.path_for(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let part = self.part_path_for(id);
        if part.exists() {
            let _ = fs::remove_file(&part);
        }
        Ok(())
    }

    // ========================================================================
    // Upload staging
    // ========================================================================

    /// Present the cache file under its intended remote name without moving
    /// it: a transient symlink in the staging directory. The link is removed
    /// when the returned guard drops.
    pub fn stage_for_upload(
        &self,
        id: &ObjectId,
        remote_name: &str,
    ) -> Result<StagedUpload, CacheError> {
        let link = self.staging_dir.join(remote_name);
        if link.exists() {
            fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(self.path_for(id), &link)?;
        Ok(StagedUpload { path: link })
    }

    // ========================================================================
    // Reclamation
    // ========================================================================

    /// Deallocate one chunk's data blocks while keeping the logical size
    /// (`fallocate` with `PUNCH_HOLE | KEEP_SIZE`).
    pub fn punch_hole(&self, id: &ObjectId, offset: u64, len: u64) -> Result<(), CacheError> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.path_for(id))
            .map_err(CacheError::from_io)?;
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if rc != 0 {
            return Err(CacheError::from_io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Bytes actually allocated on disk across the cache (sparse holes do
    /// not count).
    pub fn disk_usage(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.objects_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                total += entry.metadata()?.blocks() * 512;
            }
        }
        Ok(total)
    }

    /// Startup sweep: remove every leftover `.part` file. Returns the count.
    pub fn sweep_part_files(&self) -> Result<u64, CacheError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.objects_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".part") {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Swept leftover partial downloads");
        }
        Ok(removed)
    }

    /// Streaming SHA-256 of the cached content.
    pub fn file_hash(&self, id: &ObjectId) -> Result<FileHash, CacheError> {
        let mut file = File::open(self.path_for(id)).map_err(CacheError::from_io)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buffer).map_err(CacheError::from_io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        let digest = format!("{:x}", hasher.finalize());
        Ok(FileHash::new(digest).expect("sha256 hex digest is always valid"))
    }

    /// Logical size of the cached file, if present.
    pub fn logical_size(&self, id: &ObjectId) -> Result<Option<u64>, CacheError> {
        match fs::metadata(self.path_for(id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::from_io(e)),
        }
    }
}

/// Guard for a staged upload symlink; removes the link on drop.
pub struct StagedUpload {
    path: PathBuf,
}

impl StagedUpload {
    /// The staging path presented to the remote adapter.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the staged bytes (follows the symlink to the cache file).
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn setup() -> (tempfile::TempDir, CacheStore) {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path()).expect("cache store");
        (dir, cache)
    }

    #[test]
    fn test_part_then_commit_roundtrip() {
        let (_dir, cache) = setup();
        let id = ObjectId::new();
        let data = b"hello orchard";

        cache.write_part(&id, data).unwrap();
        assert!(!cache.exists(&id));
        cache.commit_part(&id).unwrap();
        assert!(cache.exists(&id));
        assert!(!cache.part_path_for(&id).exists());

        let read = cache.read_range(&id, 0, data.len()).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_reserve_creates_sparse_file_of_logical_size() {
        let (_dir, cache) = setup();
        let id = ObjectId::new();
        let size = 64 * 1024 * 1024;

        cache.reserve(&id, size).unwrap();
        assert_eq!(cache.logical_size(&id).unwrap(), Some(size));
        // A freshly reserved sparse file occupies (almost) no data blocks.
        assert!(cache.disk_usage().unwrap() < 1024 * 1024);
    }

    #[test]
    fn test_write_chunk_at_offset() {
        let (_dir, cache) = setup();
        let id = ObjectId::new();
        cache.reserve(&id, 32).unwrap();

        cache.write_chunk(&id, 8, b"AAAA").unwrap();
        let read = cache.read_range(&id, 6, 8).unwrap();
        assert_eq!(read, b"\0\0AAAA\0\0");
        // Logical size is unchanged by an interior write.
        assert_eq!(cache.logical_size(&id).unwrap(), Some(32));
    }

    #[test]
    fn test_read_past_eof_truncates() {
        let (_dir, cache) = setup();
        let id = ObjectId::new();
        cache.write_at(&id, 0, b"short").unwrap();
        let read = cache.read_range(&id, 0, 100).unwrap();
        assert_eq!(read, b"short");
    }

    #[test]
    fn test_stage_for_upload_symlink_lifecycle() {
        let (dir, cache) = setup();
        let id = ObjectId::new();
        cache.write_at(&id, 0, b"upload me").unwrap();

        let staging_path = dir.path().join("staging").join("Report Final.pdf");
        {
            let staged = cache.stage_for_upload(&id, "Report Final.pdf").unwrap();
            assert_eq!(staged.path(), staging_path.as_path());
            assert!(staging_path.symlink_metadata().unwrap().file_type().is_symlink());
            assert_eq!(staged.read().unwrap(), b"upload me");
            // The cache file itself never moved.
            assert!(cache.exists(&id));
        }
        // Guard dropped, link gone, content untouched.
        assert!(!staging_path.exists());
        assert!(cache.exists(&id));
    }

    #[test]
    fn test_punch_hole_keeps_logical_size() {
        let (_dir, cache) = setup();
        let id = ObjectId::new();
        let block = vec![0x42u8; 1024 * 1024];
        cache.reserve(&id, 4 * 1024 * 1024).unwrap();
        cache.write_chunk(&id, 0, &block).unwrap();

        let used_before = cache.disk_usage().unwrap();
        cache.punch_hole(&id, 0, 1024 * 1024).unwrap();
        let used_after = cache.disk_usage().unwrap();

        assert!(used_after < used_before);
        assert_eq!(cache.logical_size(&id).unwrap(), Some(4 * 1024 * 1024));
        // Punched range reads back as zeros.
        let read = cache.read_range(&id, 0, 16).unwrap();
        assert_eq!(read, vec![0u8; 16]);
    }

    #[test]
    fn test_sweep_part_files() {
        let (_dir, cache) = setup();
        let a = ObjectId::new();
        let b = ObjectId::new();
        cache.write_part(&a, b"half").unwrap();
        cache.write_part(&b, b"way").unwrap();
        cache.write_at(&ObjectId::new(), 0, b"keep me").unwrap();

        assert_eq!(cache.sweep_part_files().unwrap(), 2);
        assert_eq!(cache.sweep_part_files().unwrap(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, cache) = setup();
        let id = ObjectId::new();
        cache.write_at(&id, 0, b"x").unwrap();
        cache.write_part(&id, b"y").unwrap();

        cache.remove(&id).unwrap();
        assert!(!cache.exists(&id));
        assert!(!cache.part_path_for(&id).exists());
        cache.remove(&id).unwrap();
    }

    #[test]
    fn test_file_hash_matches_known_digest() {
        let (_dir, cache) = setup();
        let id = ObjectId::new();
        cache.write_at(&id, 0, b"abc").unwrap();
        // sha256("abc")
        assert_eq!(
            cache.file_hash(&id).unwrap().as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
