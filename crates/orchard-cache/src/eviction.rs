//! LRU eviction over the content cache.
//!
//! When allocated bytes exceed the configured ceiling, an eviction pass
//! reclaims space in two tiers: hole-punch the least-recently-accessed
//! chunks of sparse entries first, then remove whole unpinned full entries.
//! Entries with `open_count > 0` or `pinned = 1` are never touched — the
//! store's eligibility queries enforce that.

use std::sync::Arc;

use orchard_core::domain::cache_entry::chunk_byte_range;
use orchard_core::domain::Presence;
use orchard_store::StateStore;

use crate::{CacheError, CacheStore};

/// What an eviction pass reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionSummary {
    pub chunks_punched: u64,
    pub entries_evicted: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Runs eviction passes against the cache and presence rows.
pub struct Evictor {
    store: StateStore,
    cache: Arc<CacheStore>,
    max_bytes: u64,
    chunk_size: u64,
}

impl Evictor {
    #[must_use]
    pub fn new(store: StateStore, cache: Arc<CacheStore>, max_bytes: u64, chunk_size: u64) -> Self {
        Self {
            store,
            cache,
            max_bytes,
            chunk_size,
        }
    }

    /// True when the cache is over its ceiling.
    pub fn over_ceiling(&self) -> Result<bool, CacheError> {
        Ok(self.cache.disk_usage()? > self.max_bytes)
    }

    /// Reclaim until usage is at or below the ceiling, or nothing more is
    /// eligible. Chunk rows and bytes go together: the hole is punched
    /// first, then the row removed, so a crash leaves at worst a punched
    /// chunk still marked present, which re-punches harmlessly next pass.
    pub async fn run_pass(&self) -> Result<EvictionSummary, CacheError> {
        let bytes_before = self.cache.disk_usage()?;
        let mut summary = EvictionSummary {
            bytes_before,
            bytes_after: bytes_before,
            ..Default::default()
        };
        if bytes_before <= self.max_bytes {
            return Ok(summary);
        }

        tracing::info!(
            used = bytes_before,
            ceiling = self.max_bytes,
            "Cache over ceiling, starting eviction pass"
        );

        // Tier 1: punch the oldest chunks.
        while self.cache.disk_usage()? > self.max_bytes {
            let batch = self.store.oldest_chunks(64).await?;
            if batch.is_empty() {
                break;
            }
            for chunk in batch {
                let entry = match self.store.get_cache_entry(&chunk.object_id).await? {
                    Some(e) if e.presence == Presence::Sparse && e.evictable() => e,
                    _ => continue,
                };
                let (start, end) = chunk_byte_range(chunk.chunk_index, entry.size, self.chunk_size);
                self.cache
                    .punch_hole(&chunk.object_id, start, end - start + 1)?;
                self.store
                    .remove_chunks(&chunk.object_id, &[chunk.chunk_index])
                    .await?;
                summary.chunks_punched += 1;
                if self.cache.disk_usage()? <= self.max_bytes {
                    break;
                }
            }
        }

        // Tier 2: remove whole unpinned full entries, oldest first.
        while self.cache.disk_usage()? > self.max_bytes {
            let batch = self.store.evictable_full_entries(16).await?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                self.cache.remove(&entry.object_id)?;
                self.store
                    .set_presence(&entry.object_id, Presence::Absent)
                    .await?;
                summary.entries_evicted += 1;
                if self.cache.disk_usage()? <= self.max_bytes {
                    break;
                }
            }
        }

        summary.bytes_after = self.cache.disk_usage()?;
        tracing::info!(
            chunks_punched = summary.chunks_punched,
            entries_evicted = summary.entries_evicted,
            freed = summary.bytes_before.saturating_sub(summary.bytes_after),
            "Eviction pass finished"
        );
        Ok(summary)
    }
}
