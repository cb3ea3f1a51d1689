//! Cache presence rows and chunk arithmetic.
//!
//! File content lives on disk under the cache root (see `orchard-cache`);
//! these types are the store's view of what is present. Small files are
//! either fully present or absent; files at or above the small-file
//! threshold use sparse allocation with per-chunk presence rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::newtypes::{FileHash, ObjectId};

/// How much of a file's content is locally materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Absent,
    Full,
    Sparse,
}

impl Presence {
    /// Integer form stored in the database (0 = absent, 1 = full, 2 = sparse).
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        match self {
            Presence::Absent => 0,
            Presence::Full => 1,
            Presence::Sparse => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Presence::Absent),
            1 => Some(Presence::Full),
            2 => Some(Presence::Sparse),
            _ => None,
        }
    }
}

/// Cache bookkeeping for one file object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub object_id: ObjectId,
    pub local_path: PathBuf,
    /// Logical size the backing file is truncated to.
    pub size: u64,
    pub file_hash: Option<FileHash>,
    pub presence: Presence,
    /// Pinned entries stay fully cached and are exempt from eviction.
    pub pinned: bool,
    pub last_accessed: DateTime<Utc>,
    /// Open FUSE handles; non-zero gates eviction.
    pub open_count: u32,
}

impl CacheEntry {
    #[must_use]
    pub fn new(object_id: ObjectId, local_path: PathBuf, size: u64) -> Self {
        Self {
            object_id,
            local_path,
            size,
            file_hash: None,
            presence: Presence::Absent,
            pinned: false,
            last_accessed: Utc::now(),
            open_count: 0,
        }
    }

    /// True when eviction may touch this entry.
    #[must_use]
    pub fn evictable(&self) -> bool {
        !self.pinned && self.open_count == 0
    }
}

/// Presence row for one fixed-size block of a sparse file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub object_id: ObjectId,
    pub chunk_index: u32,
    pub last_accessed: DateTime<Utc>,
}

// ============================================================================
// Chunk arithmetic
// ============================================================================

/// Number of chunks needed to cover `size` bytes: `⌈size / chunk_size⌉`.
///
/// Zero-byte files need no chunks.
#[must_use]
pub fn chunk_count(size: u64, chunk_size: u64) -> u32 {
    debug_assert!(chunk_size > 0);
    size.div_ceil(chunk_size) as u32
}

/// The inclusive byte range `[start, end]` of chunk `index`, clamped to
/// `size`. Shaped for an HTTP range request.
#[must_use]
pub fn chunk_byte_range(index: u32, size: u64, chunk_size: u64) -> (u64, u64) {
    let start = u64::from(index) * chunk_size;
    let end = ((u64::from(index) + 1) * chunk_size).min(size) - 1;
    (start, end)
}

/// Chunk indices overlapping the half-open byte range `[offset, offset+len)`,
/// clamped to the file size.
#[must_use]
pub fn chunks_for_range(offset: u64, len: u64, size: u64, chunk_size: u64) -> Vec<u32> {
    if len == 0 || offset >= size || size == 0 {
        return Vec::new();
    }
    let end = (offset + len).min(size);
    let first = (offset / chunk_size) as u32;
    let last = ((end - 1) / chunk_size) as u32;
    (first..=last).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const CHUNK: u64 = 8 * MIB;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, CHUNK), 0);
        assert_eq!(chunk_count(1, CHUNK), 1);
        assert_eq!(chunk_count(CHUNK, CHUNK), 1);
        assert_eq!(chunk_count(CHUNK + 1, CHUNK), 2);
        assert_eq!(chunk_count(100 * MIB, CHUNK), 13);
    }

    #[test]
    fn test_chunk_byte_range_clamps_tail() {
        let size = 100 * MIB;
        assert_eq!(chunk_byte_range(0, size, CHUNK), (0, CHUNK - 1));
        // Last chunk of a 100 MiB file covers 96..100 MiB.
        assert_eq!(chunk_byte_range(12, size, CHUNK), (96 * MIB, size - 1));
    }

    #[test]
    fn test_read_at_90_mib_needs_only_chunk_11() {
        // 90 MiB / 8 MiB = 11.25 → index 11.
        let size = 100 * MIB;
        assert_eq!(chunks_for_range(90 * MIB, 4096, size, CHUNK), vec![11]);
    }

    #[test]
    fn test_boundary_read_spans_two_chunks() {
        let size = 100 * MIB;
        assert_eq!(chunks_for_range(CHUNK - 1, 2, size, CHUNK), vec![0, 1]);
    }

    #[test]
    fn test_range_beyond_eof_is_empty() {
        assert_eq!(chunks_for_range(200 * MIB, 4096, 100 * MIB, CHUNK), Vec::<u32>::new());
        assert_eq!(chunks_for_range(0, 0, 100 * MIB, CHUNK), Vec::<u32>::new());
    }

    #[test]
    fn test_presence_int_roundtrip() {
        for p in [Presence::Absent, Presence::Full, Presence::Sparse] {
            assert_eq!(Presence::from_i64(p.as_i64()), Some(p));
        }
        assert_eq!(Presence::from_i64(7), None);
    }

    #[test]
    fn test_evictable() {
        let mut entry = CacheEntry::new(ObjectId::new(), PathBuf::from("/tmp/x"), 10);
        assert!(entry.evictable());
        entry.open_count = 1;
        assert!(!entry.evictable());
        entry.open_count = 0;
        entry.pinned = true;
        assert!(!entry.evictable());
    }
}
