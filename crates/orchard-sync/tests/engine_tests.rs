//! End-to-end engine tests: in-memory remote, in-memory store, real cache
//! files in a tempdir. `drain()` runs workers deterministically.

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use orchard_cache::{CacheStore, ChunkWaiters, Evictor};
use orchard_core::config::ConflictPolicy;
use orchard_core::domain::action::{PRIORITY_BACKGROUND, PRIORITY_FUSE, PRIORITY_INTERACTIVE};
use orchard_core::domain::{
    Action, ActionType, CloudId, Direction, ObjectKind, Presence, SyncState,
};
use orchard_core::ports::remote::RemoteAdapter;
use orchard_remote::MemoryRemote;
use orchard_store::{BackoffConfig, DatabasePool, StateStore, WorkerClass};
use orchard_sync::{Connectivity, EngineConfig, SyncEngine};

const CHUNK: u64 = 8;
const THRESHOLD: u64 = 64;

struct Fixture {
    _dir: tempfile::TempDir,
    store: StateStore,
    cache: Arc<CacheStore>,
    remote: Arc<MemoryRemote>,
    engine: Arc<SyncEngine>,
    root_id: orchard_core::domain::ObjectId,
    root_cloud: CloudId,
}

async fn fixture() -> Fixture {
    fixture_with_policy(ConflictPolicy::LocalWins).await
}

async fn fixture_with_policy(policy: ConflictPolicy) -> Fixture {
    let dir = tempdir().expect("tempdir");
    let pool = DatabasePool::in_memory().await.expect("pool");
    let store = StateStore::new(&pool);
    let cache = Arc::new(CacheStore::new(dir.path()).expect("cache"));
    let waiters = Arc::new(ChunkWaiters::new());
    let remote = Arc::new(MemoryRemote::new());
    let root_cloud = remote.seed_root();
    let root = store.ensure_root(Some(root_cloud.clone())).await.unwrap();
    let evictor = Arc::new(Evictor::new(store.clone(), cache.clone(), u64::MAX, CHUNK));

    let config = EngineConfig {
        chunk_size: CHUNK,
        small_file_threshold: THRESHOLD,
        backoff: BackoffConfig {
            base_ms: 10,
            max_ms: 100,
            max_retries: 5,
        },
        conflict_policy: policy,
        worker_count_io: 1,
        worker_count_meta: 1,
        idle_poll: Duration::from_millis(10),
        offline_backoff: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
    };
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        cache.clone(),
        waiters,
        remote.clone(),
        evictor,
        config,
        Connectivity::new(),
    ));

    Fixture {
        _dir: dir,
        store,
        cache,
        remote,
        engine,
        root_id: root.id,
        root_cloud,
    }
}

async fn enqueue(fx: &Fixture, action_type: ActionType, target: orchard_core::domain::ObjectId, direction: Direction, priority: i32) {
    fx.store
        .enqueue(&Action::new(action_type, target, direction, priority))
        .await
        .unwrap();
}

async fn drain_with_retries(fx: &Fixture) {
    // Drain, then wait out any backoff windows and drain again.
    for _ in 0..5 {
        fx.engine.drain().await.unwrap();
        if fx.store.pending_count().await.unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

// ============================================================================
// Pull side
// ============================================================================

#[tokio::test]
async fn test_listing_discovers_remote_tree() {
    let fx = fixture().await;
    let docs = fx.remote.seed_folder(&fx.root_cloud, "docs");
    fx.remote.seed_file(&fx.root_cloud, "readme.txt", b"top");
    fx.remote.seed_file(&docs, "deep.txt", b"nested");

    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let readme = fx.store.resolve_path("readme.txt").await.unwrap();
    assert_eq!(readme.sync_state, SyncState::Synced);
    assert_eq!(readme.size, 3);
    assert!(fx.store.get_shadow(&readme.id).await.unwrap().is_some());
    // No cache entry until content is demanded.
    assert!(fx.store.get_cache_entry(&readme.id).await.unwrap().is_none());

    // Single-level listing walked into the subfolder via a separate enqueue.
    let deep = fx.store.resolve_path("docs/deep.txt").await.unwrap();
    assert_eq!(deep.sync_state, SyncState::Synced);
}

#[tokio::test]
async fn test_full_download_small_file() {
    let fx = fixture().await;
    fx.remote.seed_file(&fx.root_cloud, "note.txt", b"hello world");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let note = fx.store.resolve_path("note.txt").await.unwrap();
    enqueue(&fx, ActionType::Download, note.id, Direction::Pull, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    let entry = fx.store.get_cache_entry(&note.id).await.unwrap().unwrap();
    assert_eq!(entry.presence, Presence::Full);
    assert!(entry.file_hash.is_some());
    assert_eq!(fx.cache.read_range(&note.id, 0, 11).unwrap(), b"hello world");
    // No .part leftovers after the atomic swap.
    assert!(!fx.cache.part_path_for(&note.id).exists());
}

#[tokio::test]
async fn test_chunk_downloads_promote_to_full() {
    let fx = fixture().await;
    // 20 bytes at chunk size 8 → chunks 0, 1, 2.
    let content: Vec<u8> = (0..20u8).collect();
    fx.remote.seed_file(&fx.root_cloud, "big.bin", &content);
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let big = fx.store.resolve_path("big.bin").await.unwrap();
    for index in [0u32, 1, 2] {
        fx.store
            .enqueue(
                &Action::new(ActionType::DownloadChunk, big.id, Direction::Pull, PRIORITY_FUSE)
                    .with_metadata(serde_json::json!({"chunk_index": index})),
            )
            .await
            .unwrap();
    }
    drain_with_retries(&fx).await;

    let entry = fx.store.get_cache_entry(&big.id).await.unwrap().unwrap();
    assert_eq!(entry.presence, Presence::Full, "all chunks present promotes");
    assert!(fx.store.chunk_indices(&big.id).await.unwrap().is_empty());
    assert_eq!(fx.cache.read_range(&big.id, 0, 20).unwrap(), content);
}

#[tokio::test]
async fn test_chunk_etag_drift_invalidates_and_reconciles() {
    let fx = fixture().await;
    let content = vec![1u8; 20];
    let cloud = fx.remote.seed_file(&fx.root_cloud, "big.bin", &content);
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let big = fx.store.resolve_path("big.bin").await.unwrap();
    // Remote changes after we recorded the listing etag.
    fx.remote.mutate_content(&cloud, &vec![2u8; 20]);

    fx.store
        .enqueue(
            &Action::new(ActionType::DownloadChunk, big.id, Direction::Pull, PRIORITY_FUSE)
                .with_metadata(serde_json::json!({"chunk_index": 0})),
        )
        .await
        .unwrap();
    drain_with_retries(&fx).await;

    // No stale chunk rows survive, and the reconcile moved the token forward.
    assert!(fx.store.chunk_indices(&big.id).await.unwrap().is_empty());
    let refreshed = fx.store.get_object(&big.id).await.unwrap().unwrap();
    let meta = fx.remote.metadata(&cloud).await.unwrap();
    assert_eq!(refreshed.etag, Some(meta.etag));
}

#[tokio::test]
async fn test_small_file_threshold_boundary() {
    let fx = fixture().await;
    let small_cloud = fx.remote.seed_file(
        &fx.root_cloud,
        "small.bin",
        &vec![1u8; (THRESHOLD - 1) as usize],
    );
    let large_cloud = fx.remote.seed_file(
        &fx.root_cloud,
        "large.bin",
        &vec![1u8; THRESHOLD as usize],
    );
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let small = fx.store.resolve_path("small.bin").await.unwrap();
    let large = fx.store.resolve_path("large.bin").await.unwrap();

    // Mark both as fully cached, then change them remotely so the next
    // listing schedules a content refresh for each.
    for id in [small.id, large.id] {
        let mut entry = orchard_core::domain::CacheEntry::new(id, fx.cache.path_for(&id), 0);
        entry.presence = Presence::Full;
        fx.store.upsert_cache_entry(&entry).await.unwrap();
    }
    fx.remote.mutate_content(&small_cloud, &vec![2u8; (THRESHOLD - 1) as usize]);
    fx.remote.mutate_content(&large_cloud, &vec![2u8; THRESHOLD as usize]);

    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    // Run only the listing so the scheduled refreshes stay inspectable.
    fx.engine
        .process_one("meta-probe", WorkerClass::Meta)
        .await
        .unwrap();

    // threshold − 1 → full download; exactly threshold → sparse (chunks on
    // demand, stale chunks invalidated, no full download enqueued).
    let small_pending = fx.store.pending_actions_for(&small.id).await.unwrap();
    assert_eq!(small_pending.len(), 1);
    assert_eq!(small_pending[0].action_type, ActionType::Download);

    let large_pending = fx.store.pending_actions_for(&large.id).await.unwrap();
    assert!(large_pending.is_empty());
    let large_entry = fx.store.get_cache_entry(&large.id).await.unwrap().unwrap();
    assert_eq!(large_entry.presence, Presence::Absent);
}

// ============================================================================
// Push side
// ============================================================================

#[tokio::test]
async fn test_local_create_upload_binds_cloud_identity() {
    let fx = fixture().await;
    let folder = fx
        .store
        .create_local_object(&fx.root_id, "projects", ObjectKind::Folder)
        .await
        .unwrap();
    enqueue(&fx, ActionType::Upload, folder.id, Direction::Push, PRIORITY_INTERACTIVE).await;

    let file = fx
        .store
        .create_local_object(&folder.id, "plan.txt", ObjectKind::File)
        .await
        .unwrap();
    fx.cache.write_at(&file.id, 0, b"the plan").unwrap();
    enqueue(&fx, ActionType::Upload, file.id, Direction::Push, PRIORITY_INTERACTIVE).await;

    drain_with_retries(&fx).await;

    let folder = fx.store.get_object(&folder.id).await.unwrap().unwrap();
    let file = fx.store.get_object(&file.id).await.unwrap().unwrap();
    assert_eq!(folder.sync_state, SyncState::Synced);
    assert_eq!(file.sync_state, SyncState::Synced);
    assert!(file.cloud_id.is_some());
    assert!(file.etag.is_some());
    assert!(fx.store.get_shadow(&file.id).await.unwrap().is_some());

    let remote_file = fx
        .remote
        .find_child(&folder.cloud_id.clone().unwrap(), "plan.txt")
        .unwrap();
    assert_eq!(fx.remote.content_of(&remote_file).unwrap(), b"the plan");
}

#[tokio::test]
async fn test_child_upload_waits_for_parent_push() {
    let fx = fixture().await;
    let folder = fx
        .store
        .create_local_object(&fx.root_id, "later", ObjectKind::Folder)
        .await
        .unwrap();
    let file = fx
        .store
        .create_local_object(&folder.id, "kid.txt", ObjectKind::File)
        .await
        .unwrap();
    fx.cache.write_at(&file.id, 0, b"kid").unwrap();

    // File first: its upload must retry until the folder lands.
    enqueue(&fx, ActionType::Upload, file.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    fx.engine.drain().await.unwrap();
    assert!(fx
        .store
        .get_object(&file.id)
        .await
        .unwrap()
        .unwrap()
        .cloud_id
        .is_none());

    enqueue(&fx, ActionType::Upload, folder.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    let file = fx.store.get_object(&file.id).await.unwrap().unwrap();
    assert_eq!(file.sync_state, SyncState::Synced);
    assert!(file.cloud_id.is_some());
}

#[tokio::test]
async fn test_offline_edits_coalesce_to_single_upload() {
    let fx = fixture().await;
    fx.remote.set_offline(true);

    let note = fx
        .store
        .create_local_object(&fx.root_id, "note.txt", ObjectKind::File)
        .await
        .unwrap();
    fx.cache.write_at(&note.id, 0, b"hello").unwrap();
    enqueue(&fx, ActionType::Upload, note.id, Direction::Push, PRIORITY_INTERACTIVE).await;

    // Two further edits while offline coalesce into the pending upload.
    fx.cache.write_at(&note.id, 0, b"hello again").unwrap();
    enqueue(&fx, ActionType::UpdateContent, note.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    fx.cache.write_at(&note.id, 0, b"hello final").unwrap();
    enqueue(&fx, ActionType::UpdateContent, note.id, Direction::Push, PRIORITY_INTERACTIVE).await;

    assert_eq!(fx.store.pending_actions_for(&note.id).await.unwrap().len(), 1);

    // First attempt fails transiently and flips the engine offline.
    fx.engine.drain().await.unwrap();
    assert!(!fx.engine.connectivity().is_online());
    assert_eq!(fx.remote.calls().upload, 0);

    // Reconnect.
    fx.remote.set_offline(false);
    fx.engine.connectivity().mark_online();
    tokio::time::sleep(Duration::from_millis(30)).await;
    drain_with_retries(&fx).await;

    let note = fx.store.get_object(&note.id).await.unwrap().unwrap();
    assert_eq!(note.sync_state, SyncState::Synced);
    assert!(note.cloud_id.is_some());
    assert_eq!(fx.remote.calls().upload, 1, "exactly one network upload");
    let remote_id = fx.remote.find_child(&fx.root_cloud, "note.txt").unwrap();
    assert_eq!(fx.remote.content_of(&remote_id).unwrap(), b"hello final");
}

#[tokio::test]
async fn test_replaying_push_after_completion_is_harmless() {
    let fx = fixture().await;
    let file = fx
        .store
        .create_local_object(&fx.root_id, "same.txt", ObjectKind::File)
        .await
        .unwrap();
    fx.cache.write_at(&file.id, 0, b"stable").unwrap();
    enqueue(&fx, ActionType::Upload, file.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    let first = fx.store.get_object(&file.id).await.unwrap().unwrap();

    // A second push of identical content converges to the same remote state.
    enqueue(&fx, ActionType::Upload, file.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    let second = fx.store.get_object(&file.id).await.unwrap().unwrap();
    assert_eq!(second.sync_state, SyncState::Synced);
    assert_eq!(second.cloud_id, first.cloud_id);
    let remote_id = fx.remote.find_child(&fx.root_cloud, "same.txt").unwrap();
    assert_eq!(fx.remote.content_of(&remote_id).unwrap(), b"stable");
}

// ============================================================================
// Conflict protocol
// ============================================================================

#[tokio::test]
async fn test_etag_mismatch_local_wins_displaces_remote() {
    let fx = fixture().await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "doc.txt", b"original");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let doc = fx.store.resolve_path("doc.txt").await.unwrap();

    // Local write, then the remote changes before our push runs.
    fx.cache.write_at(&doc.id, 0, b"local edit").unwrap();
    fx.store.mark_dirty(&doc.id).await.unwrap();
    enqueue(&fx, ActionType::UpdateContent, doc.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    fx.remote.mutate_content(&cloud, b"remote edit");

    drain_with_retries(&fx).await;

    let doc = fx.store.get_object(&doc.id).await.unwrap().unwrap();
    assert_eq!(doc.sync_state, SyncState::Synced);
    assert!(!doc.dirty);

    // The displaced remote id is preserved for audit.
    let history = doc.conflict_history.as_deref().expect("conflict history recorded");
    assert!(history.contains(cloud.as_str()));

    // Shadow matches the freshly uploaded version.
    let shadow = fx.store.get_shadow(&doc.id).await.unwrap().unwrap();
    assert_eq!(Some(&shadow.etag), doc.etag.as_ref());

    // Remote now holds the local bytes.
    let winner = fx.remote.find_child(&fx.root_cloud, "doc.txt").unwrap();
    assert_eq!(fx.remote.content_of(&winner).unwrap(), b"local edit");
    assert_eq!(fx.remote.calls().delete, 1, "old version was displaced");
}

#[tokio::test]
async fn test_etag_mismatch_remote_wins_pulls() {
    let fx = fixture_with_policy(ConflictPolicy::RemoteWins).await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "doc.txt", b"original");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let doc = fx.store.resolve_path("doc.txt").await.unwrap();
    fx.cache.write_at(&doc.id, 0, b"doomed local edit").unwrap();
    fx.store.mark_dirty(&doc.id).await.unwrap();
    enqueue(&fx, ActionType::UpdateContent, doc.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    fx.remote.mutate_content(&cloud, b"remote edit wins");

    drain_with_retries(&fx).await;

    let doc = fx.store.get_object(&doc.id).await.unwrap().unwrap();
    assert_eq!(doc.sync_state, SyncState::Synced);
    assert_eq!(fx.cache.read_range(&doc.id, 0, 16).unwrap(), b"remote edit wins");
    assert!(fx.remote.node_exists(&cloud), "remote version survived");
}

#[tokio::test]
async fn test_etag_mismatch_manual_surfaces_conflict() {
    let fx = fixture_with_policy(ConflictPolicy::Manual).await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "doc.txt", b"original");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let doc = fx.store.resolve_path("doc.txt").await.unwrap();
    fx.cache.write_at(&doc.id, 0, b"contested").unwrap();
    fx.store.mark_dirty(&doc.id).await.unwrap();
    enqueue(&fx, ActionType::UpdateContent, doc.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    fx.remote.mutate_content(&cloud, b"contested remotely");

    drain_with_retries(&fx).await;

    let doc = fx.store.get_object(&doc.id).await.unwrap().unwrap();
    assert_eq!(doc.sync_state, SyncState::Conflict);
    assert_eq!(fx.store.list_conflicts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_vs_edit_repushes_as_new() {
    let fx = fixture().await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "doc.txt", b"v1");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let doc = fx.store.resolve_path("doc.txt").await.unwrap();
    fx.cache.write_at(&doc.id, 0, b"local edit").unwrap();
    fx.store.mark_dirty(&doc.id).await.unwrap();

    // Remote deletes it behind our back; the next listing notices.
    fx.remote.delete_out_of_band(&cloud);
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let doc = fx.store.get_object(&doc.id).await.unwrap().unwrap();
    assert_eq!(doc.sync_state, SyncState::Synced, "undeleted via re-push");
    let new_cloud = doc.cloud_id.clone().unwrap();
    assert_ne!(new_cloud, cloud, "re-pushed as a new cloud object");
    assert_eq!(fx.remote.content_of(&new_cloud).unwrap(), b"local edit");
}

#[tokio::test]
async fn test_edit_vs_delete_restores_remote_version() {
    let fx = fixture().await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "doc.txt", b"v1");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let doc = fx.store.resolve_path("doc.txt").await.unwrap();

    // Local delete queued, but the remote edits first.
    fx.remote.mutate_content(&cloud, b"v2 remote");
    fx.store
        .mark_deleted(&doc.id, SyncState::DeletedLocal)
        .await
        .unwrap();
    enqueue(&fx, ActionType::Delete, doc.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    let doc = fx.store.get_object(&doc.id).await.unwrap().unwrap();
    assert!(!doc.deleted, "local delete cancelled");
    assert_eq!(doc.sync_state, SyncState::Synced);
    assert!(fx.remote.node_exists(&cloud), "remote version survived");
    assert_eq!(fx.cache.read_range(&doc.id, 0, 9).unwrap(), b"v2 remote");
}

#[tokio::test]
async fn test_remote_delete_of_clean_object_tombstones() {
    let fx = fixture().await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "gone.txt", b"x");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let gone = fx.store.resolve_path("gone.txt").await.unwrap();
    fx.remote.delete_out_of_band(&cloud);
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    // Row survives as a tombstone; projection is gone.
    let tombstones = fx.store.list_tombstones().await.unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].id, gone.id);
    assert_eq!(tombstones[0].sync_state, SyncState::DeletedCloud);
    assert!(fx.store.resolve_path("gone.txt").await.is_err());
}

#[tokio::test]
async fn test_remote_delete_defers_purge_while_open() {
    let fx = fixture().await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "open.txt", b"held");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let open = fx.store.resolve_path("open.txt").await.unwrap();
    enqueue(&fx, ActionType::Download, open.id, Direction::Pull, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;
    fx.store.adjust_open_count(&open.id, 1).await.unwrap();

    fx.remote.delete_out_of_band(&cloud);
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    // Cache content retained while a handle is open.
    assert!(fx.cache.exists(&open.id));
    assert!(fx.store.get_cache_entry(&open.id).await.unwrap().is_some());

    // Last close: the deferred teardown runs.
    fx.store.adjust_open_count(&open.id, -1).await.unwrap();
    enqueue(&fx, ActionType::Delete, open.id, Direction::Pull, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;
    assert!(!fx.cache.exists(&open.id));
    assert!(fx.store.get_cache_entry(&open.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_local_delete_pushes_and_purges() {
    let fx = fixture().await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "bye.txt", b"x");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let bye = fx.store.resolve_path("bye.txt").await.unwrap();
    fx.store
        .mark_deleted(&bye.id, SyncState::DeletedLocal)
        .await
        .unwrap();
    enqueue(&fx, ActionType::Delete, bye.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    assert!(!fx.remote.node_exists(&cloud));
    // Both sides confirmed: row fully purged.
    assert!(fx.store.get_object(&bye.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_of_already_gone_remote_succeeds() {
    let fx = fixture().await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "bye.txt", b"x");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let bye = fx.store.resolve_path("bye.txt").await.unwrap();
    fx.remote.delete_out_of_band(&cloud);
    fx.store
        .mark_deleted(&bye.id, SyncState::DeletedLocal)
        .await
        .unwrap();
    enqueue(&fx, ActionType::Delete, bye.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    assert!(fx.store.get_object(&bye.id).await.unwrap().is_none());
}

// ============================================================================
// Rename / move
// ============================================================================

#[tokio::test]
async fn test_rename_pushes_conditionally() {
    let fx = fixture().await;
    let cloud = fx.remote.seed_file(&fx.root_cloud, "a.txt", b"x");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let a = fx.store.resolve_path("a.txt").await.unwrap();
    fx.store.rename_object(&a.id, &fx.root_id, "b.txt").await.unwrap();
    fx.store
        .enqueue(
            &Action::new(ActionType::Rename, a.id, Direction::Push, PRIORITY_INTERACTIVE)
                .with_destination("b.txt"),
        )
        .await
        .unwrap();
    drain_with_retries(&fx).await;

    let renamed = fx.store.get_object(&a.id).await.unwrap().unwrap();
    assert_eq!(renamed.sync_state, SyncState::Synced);
    assert_eq!(renamed.cloud_id.as_ref().unwrap(), &cloud, "identity preserved");
    assert!(fx.remote.find_child(&fx.root_cloud, "b.txt").is_some());
    assert!(fx.remote.find_child(&fx.root_cloud, "a.txt").is_none());
}

#[tokio::test]
async fn test_rename_collision_local_wins() {
    let fx = fixture().await;
    fx.remote.seed_file(&fx.root_cloud, "a.txt", b"ours");
    let blocker = fx.remote.seed_file(&fx.root_cloud, "b.txt", b"theirs");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;
    drain_with_retries(&fx).await;

    let a = fx.store.resolve_path("a.txt").await.unwrap();
    let b = fx.store.resolve_path("b.txt").await.unwrap();
    // Local unlink of b, then rename a → b before the delete pushes: the
    // rename displaces the remote collider on its own.
    fx.store.mark_deleted(&b.id, SyncState::DeletedLocal).await.unwrap();
    fx.store.rename_object(&a.id, &fx.root_id, "b.txt").await.unwrap();
    fx.store
        .enqueue(
            &Action::new(ActionType::Rename, a.id, Direction::Push, PRIORITY_INTERACTIVE)
                .with_destination("b.txt"),
        )
        .await
        .unwrap();
    drain_with_retries(&fx).await;

    assert!(!fx.remote.node_exists(&blocker), "collider displaced");
    let survivor = fx.remote.find_child(&fx.root_cloud, "b.txt").unwrap();
    assert_eq!(fx.remote.content_of(&survivor).unwrap(), b"ours");
}

// ============================================================================
// Engine behavior
// ============================================================================

#[tokio::test]
async fn test_auth_failure_pauses_without_burning_retries() {
    let fx = fixture().await;
    let note = fx
        .store
        .create_local_object(&fx.root_id, "note.txt", ObjectKind::File)
        .await
        .unwrap();
    fx.cache.write_at(&note.id, 0, b"x").unwrap();
    enqueue(&fx, ActionType::Upload, note.id, Direction::Push, PRIORITY_INTERACTIVE).await;

    fx.remote.set_auth_failed(true);
    fx.engine.drain().await.unwrap();

    assert!(fx.engine.connectivity().is_auth_failed());
    let pending = fx.store.pending_actions_for(&note.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 0, "auth failures burn no retries");

    fx.remote.set_auth_failed(false);
    fx.engine.connectivity().resume();
    drain_with_retries(&fx).await;
    assert_eq!(
        fx.store.get_object(&note.id).await.unwrap().unwrap().sync_state,
        SyncState::Synced
    );
}

#[tokio::test]
async fn test_zero_byte_file_roundtrip_without_chunks() {
    let fx = fixture().await;
    let empty = fx
        .store
        .create_local_object(&fx.root_id, "empty.txt", ObjectKind::File)
        .await
        .unwrap();
    enqueue(&fx, ActionType::Upload, empty.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    let pushed = fx.store.get_object(&empty.id).await.unwrap().unwrap();
    assert_eq!(pushed.sync_state, SyncState::Synced);
    let cloud = pushed.cloud_id.clone().unwrap();
    assert_eq!(fx.remote.content_of(&cloud).unwrap(), b"");

    enqueue(&fx, ActionType::Download, empty.id, Direction::Pull, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    let entry = fx.store.get_cache_entry(&empty.id).await.unwrap().unwrap();
    assert_eq!(entry.presence, Presence::Full);
    assert!(fx.store.chunk_indices(&empty.id).await.unwrap().is_empty());
    assert_eq!(fx.cache.read_range(&empty.id, 0, 10).unwrap(), b"");
}

#[tokio::test]
async fn test_write_release_upload_download_roundtrip() {
    let fx = fixture().await;
    let file = fx
        .store
        .create_local_object(&fx.root_id, "cycle.bin", ObjectKind::File)
        .await
        .unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(100).collect();
    fx.cache.write_at(&file.id, 0, &payload).unwrap();
    enqueue(&fx, ActionType::Upload, file.id, Direction::Push, PRIORITY_INTERACTIVE).await;
    drain_with_retries(&fx).await;

    // Wipe the local cache and pull back through chunk requests.
    fx.cache.remove(&file.id).unwrap();
    fx.store.delete_cache_entry(&file.id).await.unwrap();

    let pushed = fx.store.get_object(&file.id).await.unwrap().unwrap();
    let total = pushed.size.div_ceil(CHUNK) as u32;
    for index in 0..total {
        fx.store
            .enqueue(
                &Action::new(ActionType::DownloadChunk, file.id, Direction::Pull, PRIORITY_FUSE)
                    .with_metadata(serde_json::json!({"chunk_index": index})),
            )
            .await
            .unwrap();
    }
    drain_with_retries(&fx).await;

    assert_eq!(
        fx.cache.read_range(&file.id, 0, payload.len()).unwrap(),
        payload,
        "byte-identical after the full cycle"
    );
}

#[tokio::test]
async fn test_workers_process_queue_and_shut_down() {
    let fx = fixture().await;
    fx.remote.seed_file(&fx.root_cloud, "bg.txt", b"background");
    enqueue(&fx, ActionType::ListChildren, fx.root_id, Direction::Pull, PRIORITY_BACKGROUND).await;

    let handles = fx.engine.spawn_workers(Some(fx.root_cloud.clone()));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if fx.store.resolve_path("bg.txt").await.is_ok() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "workers never applied the listing");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fx.engine.shutdown();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker failed to stop")
            .unwrap();
    }
}

#[tokio::test]
async fn test_claim_respects_worker_classes_end_to_end() {
    let fx = fixture().await;
    let folder = fx
        .store
        .create_local_object(&fx.root_id, "meta", ObjectKind::Folder)
        .await
        .unwrap();
    enqueue(&fx, ActionType::ListChildren, folder.id, Direction::Pull, PRIORITY_BACKGROUND).await;

    // An IO-only drain cannot touch metadata actions.
    fx.engine.process_one("io-probe", WorkerClass::Io).await.unwrap();
    assert_eq!(fx.store.pending_count().await.unwrap(), 1);

    fx.engine.process_one("meta-probe", WorkerClass::Meta).await.unwrap();
    assert_eq!(fx.store.pending_count().await.unwrap(), 0);
}
