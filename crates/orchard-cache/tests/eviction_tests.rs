//! Eviction integration tests: real files, real presence rows.

use std::sync::Arc;

use chrono::Utc;
use tempfile::tempdir;

use orchard_cache::{CacheStore, Evictor};
use orchard_core::domain::{CacheEntry, CloudId, Etag, ObjectId, ObjectKind, Presence};
use orchard_core::ports::remote::RemoteChild;
use orchard_store::{DatabasePool, StateStore};

const CHUNK: u64 = 1024 * 1024;

async fn setup() -> (tempfile::TempDir, StateStore, Arc<CacheStore>, ObjectId) {
    let dir = tempdir().expect("tempdir");
    let pool = DatabasePool::in_memory().await.expect("pool");
    let store = StateStore::new(&pool);
    let root = store.ensure_root(None).await.unwrap();
    let cache = Arc::new(CacheStore::new(dir.path()).expect("cache"));
    (dir, store, cache, root.id)
}

async fn sparse_object(
    store: &StateStore,
    cache: &CacheStore,
    root: &ObjectId,
    name: &str,
    cloud_id: &str,
    chunks: u32,
) -> ObjectId {
    let size = u64::from(chunks) * CHUNK;
    let object = store
        .apply_remote_delta(
            root,
            &RemoteChild {
                cloud_id: CloudId::new(cloud_id).unwrap(),
                name: name.to_string(),
                kind: ObjectKind::File,
                size,
                etag: Etag::new("e1").unwrap(),
                modified_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    cache.reserve(&object.id, size).unwrap();
    let mut entry = CacheEntry::new(object.id, cache.path_for(&object.id), size);
    entry.presence = Presence::Sparse;
    store.upsert_cache_entry(&entry).await.unwrap();

    // Materialize every chunk except the last so the entry stays sparse.
    let data = vec![0x5au8; CHUNK as usize];
    for index in 0..chunks.saturating_sub(1) {
        cache
            .write_chunk(&object.id, u64::from(index) * CHUNK, &data)
            .unwrap();
        store
            .apply_chunk_success(None, &object.id, index, size, CHUNK)
            .await
            .unwrap();
    }
    object.id
}

#[tokio::test]
async fn test_pass_is_noop_under_ceiling() {
    let (_dir, store, cache, root) = setup().await;
    sparse_object(&store, &cache, &root, "small.bin", "c-1", 2).await;

    let evictor = Evictor::new(store, cache, 100 * CHUNK, CHUNK);
    let summary = evictor.run_pass().await.unwrap();
    assert_eq!(summary.chunks_punched, 0);
    assert_eq!(summary.entries_evicted, 0);
}

#[tokio::test]
async fn test_pass_punches_oldest_chunks_first() {
    let (_dir, store, cache, root) = setup().await;
    let old = sparse_object(&store, &cache, &root, "old.bin", "c-old", 4).await;
    // Sleep-free recency skew: bump the newer object's chunk timestamps.
    let fresh = sparse_object(&store, &cache, &root, "fresh.bin", "c-new", 4).await;
    store
        .apply_chunk_success(None, &fresh, 0, 4 * CHUNK, CHUNK)
        .await
        .unwrap();

    let used = cache.disk_usage().unwrap();
    // Ceiling forces roughly one chunk out.
    let evictor = Evictor::new(store.clone(), cache.clone(), used - CHUNK / 2, CHUNK);
    let summary = evictor.run_pass().await.unwrap();

    assert!(summary.chunks_punched >= 1);
    assert!(summary.bytes_after < summary.bytes_before);
    // The older object lost chunks; the freshly touched one keeps chunk 0.
    let old_chunks = store.chunk_indices(&old).await.unwrap();
    assert!(old_chunks.len() < 3);
    assert!(store.chunk_indices(&fresh).await.unwrap().contains(&0));
}

#[tokio::test]
async fn test_pinned_and_open_entries_survive() {
    let (_dir, store, cache, root) = setup().await;
    let pinned = sparse_object(&store, &cache, &root, "pinned.bin", "c-p", 3).await;
    let open = sparse_object(&store, &cache, &root, "open.bin", "c-o", 3).await;
    store.set_pinned(&pinned, true).await.unwrap();
    store.adjust_open_count(&open, 1).await.unwrap();

    let evictor = Evictor::new(store.clone(), cache.clone(), 0, CHUNK);
    evictor.run_pass().await.unwrap();

    // Nothing eligible: every chunk row survives.
    assert_eq!(store.chunk_indices(&pinned).await.unwrap().len(), 2);
    assert_eq!(store.chunk_indices(&open).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_full_entries_removed_after_chunks() {
    let (_dir, store, cache, root) = setup().await;

    // One fully cached small file.
    let object = store
        .apply_remote_delta(
            &root,
            &RemoteChild {
                cloud_id: CloudId::new("c-full").unwrap(),
                name: "whole.bin".to_string(),
                kind: ObjectKind::File,
                size: 2 * CHUNK,
                etag: Etag::new("e1").unwrap(),
                modified_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    let data = vec![0x11u8; (2 * CHUNK) as usize];
    cache.write_part(&object.id, &data).unwrap();
    cache.commit_part(&object.id).unwrap();
    let mut entry = CacheEntry::new(object.id, cache.path_for(&object.id), 2 * CHUNK);
    entry.presence = Presence::Full;
    store.upsert_cache_entry(&entry).await.unwrap();

    let evictor = Evictor::new(store.clone(), cache.clone(), 0, CHUNK);
    let summary = evictor.run_pass().await.unwrap();

    assert_eq!(summary.entries_evicted, 1);
    assert!(!cache.exists(&object.id));
    let entry = store.get_cache_entry(&object.id).await.unwrap().unwrap();
    assert_eq!(entry.presence, Presence::Absent);
}

#[tokio::test]
async fn test_punched_chunk_rows_are_gone() {
    let (_dir, store, cache, root) = setup().await;
    let id = sparse_object(&store, &cache, &root, "big.bin", "c-b", 5).await;
    let before = store.chunk_indices(&id).await.unwrap().len();

    let evictor = Evictor::new(store.clone(), cache.clone(), 0, CHUNK);
    let summary = evictor.run_pass().await.unwrap();

    let after = store.chunk_indices(&id).await.unwrap().len();
    assert_eq!(before - after, summary.chunks_punched as usize);
    // No partial chunk rows: logical size still intact for remaining reads.
    assert_eq!(
        cache.logical_size(&id).unwrap(),
        Some(5 * CHUNK),
        "hole punching keeps the sparse file's logical size"
    );
}
