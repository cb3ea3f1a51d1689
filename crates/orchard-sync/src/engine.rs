//! Worker pool and error classification.
//!
//! Every handler is idempotent: re-running a completed action must not
//! double-apply effects, because a crash can leave an action `processing`
//! that startup recovery re-queues. Effects commit in single store
//! transactions after the network call succeeds, so durable state stays
//! consistent no matter where a worker dies.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use orchard_cache::{CacheError, CacheStore, ChunkWaiters, Evictor};
use orchard_core::config::{Config, ConflictPolicy};
use orchard_core::domain::{Action, SyncState};
use orchard_core::ports::remote::{RemoteAdapter, RemoteError};
use orchard_store::{BackoffConfig, StateStore, WorkerClass};

use crate::{Connectivity, SyncError};

/// Engine knobs distilled from the daemon [`Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: u64,
    pub small_file_threshold: u64,
    pub backoff: BackoffConfig,
    pub conflict_policy: ConflictPolicy,
    pub worker_count_io: usize,
    pub worker_count_meta: usize,
    /// Idle sleep between claim attempts when the queue is empty.
    pub idle_poll: Duration,
    /// Sleep while offline/paused before re-checking the fast-path flag.
    pub offline_backoff: Duration,
    /// Heartbeat probe interval.
    pub heartbeat_interval: Duration,
}

impl EngineConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size_bytes,
            small_file_threshold: config.small_file_threshold_bytes,
            backoff: BackoffConfig {
                base_ms: config.retry_base_ms,
                max_ms: config.retry_max_ms,
                max_retries: config.max_retries,
            },
            conflict_policy: config.conflict_policy,
            worker_count_io: config.worker_count_io,
            worker_count_meta: config.worker_count_meta,
            idle_poll: Duration::from_millis(250),
            offline_backoff: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// The sync engine: claims actions, drives the remote adapter, applies
/// results. Generic over the adapter through `Arc<dyn RemoteAdapter>`, so
/// replay/mock adapters can drive it in tests.
pub struct SyncEngine {
    pub(crate) store: StateStore,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) waiters: Arc<ChunkWaiters>,
    pub(crate) remote: Arc<dyn RemoteAdapter>,
    pub(crate) evictor: Arc<Evictor>,
    pub(crate) config: EngineConfig,
    connectivity: Connectivity,
    cancel: CancellationToken,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        store: StateStore,
        cache: Arc<CacheStore>,
        waiters: Arc<ChunkWaiters>,
        remote: Arc<dyn RemoteAdapter>,
        evictor: Arc<Evictor>,
        config: EngineConfig,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            store,
            cache,
            waiters,
            remote,
            evictor,
            config,
            connectivity,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Token observed by every worker; cancel it to begin shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the IO workers, the metadata worker(s), and — when the root is
    /// bound to the remote — the connectivity heartbeat.
    pub fn spawn_workers(
        self: &Arc<Self>,
        root_cloud_id: Option<orchard_core::domain::CloudId>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for i in 0..self.config.worker_count_io {
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(format!("io-{i}"), WorkerClass::Io).await;
            }));
        }
        for i in 0..self.config.worker_count_meta {
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(format!("meta-{i}"), WorkerClass::Meta).await;
            }));
        }
        if let Some(root) = root_cloud_id {
            let connectivity = self.connectivity.clone();
            let remote = self.remote.clone();
            let interval = self.config.heartbeat_interval;
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                connectivity.heartbeat(remote, root, interval, cancel).await;
            }));
        }
        info!(
            io = self.config.worker_count_io,
            meta = self.config.worker_count_meta,
            "Sync workers started"
        );
        handles
    }

    /// Cooperative shutdown: stop claiming, let in-flight actions finish.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn worker_loop(&self, worker_id: String, class: WorkerClass) {
        debug!(worker = %worker_id, "Worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.connectivity.can_work() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.offline_backoff) => continue,
                }
            }
            match self.process_one(&worker_id, class).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_poll) => {}
                    }
                }
                Err(e) => {
                    // Claim-path store failures are unexpected; back off
                    // rather than spin.
                    error!(worker = %worker_id, error = %e, "Worker claim failed");
                    tokio::time::sleep(self.config.idle_poll).await;
                }
            }
        }
        debug!(worker = %worker_id, "Worker stopped");
    }

    /// Claim and run a single action. Returns false when nothing was
    /// claimable. Exposed for deterministic tests and the drain path.
    pub async fn process_one(
        &self,
        worker_id: &str,
        class: WorkerClass,
    ) -> Result<bool, SyncError> {
        let Some(action) = self.store.claim_next(worker_id, class).await? else {
            return Ok(false);
        };
        self.run_action(action).await?;
        Ok(true)
    }

    /// Run claimable actions until the queue is idle, the engine goes
    /// offline, or it pauses. Test/drain helper.
    pub async fn drain(&self) -> Result<u64, SyncError> {
        let mut processed = 0;
        loop {
            if !self.connectivity.can_work() {
                return Ok(processed);
            }
            let io = self.process_one("drain-io", WorkerClass::Io).await?;
            let meta = self.process_one("drain-meta", WorkerClass::Meta).await?;
            if !io && !meta {
                return Ok(processed);
            }
            processed += u64::from(io) + u64::from(meta);
        }
    }

    async fn run_action(&self, action: Action) -> Result<(), SyncError> {
        let action_id = action.id;
        let target_id = action.target_id;
        let action_type = action.action_type;
        let direction = action.direction;
        debug!(
            action_id,
            action_type = action_type.as_str(),
            object_id = %target_id,
            direction = direction.as_str(),
            "Dispatching action"
        );

        let result = self.dispatch(&action).await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.classify_failure(&action, err).await;
                Ok(())
            }
        }
    }

    /// Apply the error taxonomy: transient retries with backoff, auth
    /// pauses, precondition failures surface as conflicts, local disk
    /// exhaustion triggers eviction, everything else is fatal for the
    /// action.
    async fn classify_failure(&self, action: &Action, err: SyncError) {
        let sanitized = err.to_string();
        warn!(
            action_id = action.id,
            action_type = action.action_type.as_str(),
            object_id = %action.target_id,
            direction = action.direction.as_str(),
            error = %sanitized,
            "Action failed"
        );

        match &err {
            SyncError::Remote(RemoteError::Transient(_)) => {
                self.connectivity.mark_offline();
                let _ = self
                    .store
                    .fail_action(action.id, &sanitized, &self.config.backoff)
                    .await;
            }
            SyncError::Remote(RemoteError::Auth(_)) => {
                self.connectivity.mark_auth_failed();
                // Do not burn a retry; the action reruns after resume.
                let _ = self.store.release_action(action.id).await;
            }
            SyncError::Remote(RemoteError::PreconditionFailed) => {
                // Handlers resolve preconditions in-line; one escaping here
                // means the protocol declined to auto-resolve.
                let _ = self
                    .store
                    .set_sync_state(&action.target_id, SyncState::Conflict)
                    .await;
                let _ = self.store.complete_action(action.id).await;
            }
            SyncError::Cache(CacheError::NoSpace) => {
                // Free space now, then retry the action.
                if let Err(evict_err) = self.evictor.run_pass().await {
                    error!(error = %evict_err, "Eviction pass failed after ENOSPC");
                }
                let _ = self
                    .store
                    .fail_action(action.id, &sanitized, &self.config.backoff)
                    .await;
            }
            SyncError::NotReady(_) => {
                let _ = self
                    .store
                    .fail_action(action.id, &sanitized, &self.config.backoff)
                    .await;
            }
            SyncError::Remote(RemoteError::NotModified) => {
                // Content already current; nothing to apply.
                let _ = self.store.complete_action(action.id).await;
            }
            _ => {
                // Logic/invariant violations and unclassified remote errors
                // are fatal for the action and surfaced on the object.
                let _ = self
                    .store
                    .fail_action(
                        action.id,
                        &sanitized,
                        &BackoffConfig {
                            max_retries: 0,
                            ..self.config.backoff
                        },
                    )
                    .await;
                let _ = self
                    .store
                    .set_sync_state(&action.target_id, SyncState::Error(sanitized))
                    .await;
            }
        }
    }
}
