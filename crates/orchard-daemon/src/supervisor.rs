//! Daemon supervisor.
//!
//! Owns the state store, the worker pool, the control server, and the FUSE
//! session. Startup order is fixed — store, recovery, engine, control,
//! mount — and shutdown runs in reverse, guaranteeing unmount before the
//! store closes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchard_cache::{CacheStore, ChunkWaiters, Evictor};
use orchard_control::ControlServer;
use orchard_core::config::Config;
use orchard_core::ports::remote::{RemoteAdapter, RemoteError};
use orchard_fuse::{FuseSettings, OrchardFs, ThumbnailerDenylist};
use orchard_remote::MemoryRemote;
use orchard_store::{DatabasePool, StateStore};
use orchard_sync::{Connectivity, EngineConfig, SyncEngine};

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_MOUNT: u8 = 3;
pub const EXIT_AUTH: u8 = 4;
const EXIT_GENERAL: u8 = 1;

/// How long shutdown waits for in-flight actions to finish.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// A failure annotated with the process exit code it maps to.
pub struct ExitError {
    pub code: u8,
    pub source: anyhow::Error,
}

fn exit_err(code: u8, source: anyhow::Error) -> ExitError {
    ExitError { code, source }
}

/// Build, start, serve until a termination signal, then tear down.
pub fn run(config: Config, driver: &str) -> Result<(), ExitError> {
    let runtime = tokio::runtime::Runtime::new()
        .context("failed to start runtime")
        .map_err(|e| exit_err(EXIT_GENERAL, e))?;

    runtime.block_on(async { run_inner(config, driver).await })
}

async fn run_inner(config: Config, driver: &str) -> Result<(), ExitError> {
    check_mount_point(&config.mount_point).map_err(|e| exit_err(EXIT_MOUNT, e))?;

    // --- Store and startup recovery ---
    let pool = DatabasePool::open(&config.db_path)
        .await
        .context("opening state database")
        .map_err(|e| exit_err(EXIT_GENERAL, e))?;
    let store = StateStore::new(&pool);
    let recovered = store
        .recover_orphaned_actions()
        .await
        .context("startup action recovery")
        .map_err(|e| exit_err(EXIT_GENERAL, e))?;

    let cache = Arc::new(
        CacheStore::new(&config.cache_root)
            .context("opening content cache")
            .map_err(|e| exit_err(EXIT_GENERAL, e))?,
    );
    let swept = cache
        .sweep_part_files()
        .context("sweeping partial downloads")
        .map_err(|e| exit_err(EXIT_GENERAL, e))?;
    info!(recovered, swept, "Startup recovery complete");

    // --- Remote adapter and root binding ---
    let (remote, root_cloud) = build_driver(driver).map_err(|e| exit_err(EXIT_CONFIG, e))?;
    match remote.metadata(&root_cloud).await {
        Ok(_) => {}
        Err(RemoteError::Auth(reason)) => {
            return Err(exit_err(EXIT_AUTH, anyhow::anyhow!("authentication failed: {reason}")));
        }
        Err(e) => {
            // Offline at startup is fine; the heartbeat will recover.
            warn!(error = %e, "Remote unreachable at startup, continuing offline");
        }
    }
    let root = store
        .ensure_root(Some(root_cloud.clone()))
        .await
        .context("binding root object")
        .map_err(|e| exit_err(EXIT_GENERAL, e))?;

    // --- Engine ---
    let waiters = Arc::new(ChunkWaiters::new());
    let connectivity = Connectivity::new();
    let evictor = Arc::new(Evictor::new(
        store.clone(),
        cache.clone(),
        config.cache_max_bytes,
        config.chunk_size_bytes,
    ));
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        cache.clone(),
        waiters.clone(),
        remote,
        evictor,
        EngineConfig::from_config(&config),
        connectivity.clone(),
    ));
    let worker_handles = engine.spawn_workers(Some(root_cloud));

    // --- Control API ---
    let control_cancel = CancellationToken::new();
    let control = ControlServer::new(store.clone(), connectivity.clone(), config.control_port);
    let control_handle = {
        let cancel = control_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = control.run(cancel).await {
                warn!(error = %e, "Control server stopped with error");
            }
        })
    };

    // --- FUSE mount (last up, first down) ---
    let fs = OrchardFs::new(
        tokio::runtime::Handle::current(),
        store.clone(),
        cache.clone(),
        waiters,
        root.id,
        ThumbnailerDenylist::new(&config.thumbnailer_denylist),
        FuseSettings::from_config(&config),
    );
    let mount_options = [
        fuser::MountOption::FSName("orchard".to_string()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];
    let session = fuser::spawn_mount2(fs, &config.mount_point, &mount_options)
        .context("mounting filesystem")
        .map_err(|e| exit_err(EXIT_MOUNT, e))?;
    info!(mount_point = %config.mount_point.display(), "Orchard is up");

    // --- Serve until a termination signal ---
    wait_for_shutdown_signal().await;
    info!("Shutdown requested");

    // --- Teardown, reverse order: unmount, engine, control, store ---
    drop(session);

    engine.shutdown();
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        let mut finished = 0usize;
        for handle in worker_handles {
            if handle.await.is_ok() {
                finished += 1;
            }
        }
        finished
    })
    .await;
    match drained {
        Ok(count) => info!(workers = count, "Workers drained"),
        Err(_) => warn!("Worker drain exceeded grace period, aborting remainder"),
    }

    control_cancel.cancel();
    let _ = control_handle.await;

    // Store closes when the pool drops at end of scope.
    info!("Shutdown complete");
    Ok(())
}

/// The engine refuses to start over a non-empty directory that is not an
/// Orchard mount. A stale FUSE endpoint (`ENOTCONN` on read) from a
/// previous crash is ours and safe to mount over.
fn check_mount_point(mount_point: &Path) -> anyhow::Result<()> {
    match std::fs::read_dir(mount_point) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                anyhow::bail!(
                    "mount point {} is not empty and not an Orchard mount",
                    mount_point.display()
                );
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(mount_point)
                .with_context(|| format!("creating mount point {}", mount_point.display()))
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => {
            info!(
                mount_point = %mount_point.display(),
                "Found stale Orchard mount, mounting over it"
            );
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("inspecting {}", mount_point.display())),
    }
}

fn build_driver(driver: &str) -> anyhow::Result<(Arc<dyn RemoteAdapter>, orchard_core::domain::CloudId)> {
    match driver {
        "memory" => {
            let memory = Arc::new(MemoryRemote::new());
            let root = memory.seed_root();
            let remote: Arc<dyn RemoteAdapter> = memory;
            Ok((remote, root))
        }
        other => anyhow::bail!("unknown remote driver '{other}'"),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mount_point_accepted() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_mount_point(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_mount_point_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("iCloud");
        assert!(check_mount_point(&target).is_ok());
        assert!(target.is_dir());
    }

    #[test]
    fn test_non_empty_mount_point_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("squatter"), b"x").unwrap();
        assert!(check_mount_point(dir.path()).is_err());
    }

    #[test]
    fn test_unknown_driver_rejected() {
        assert!(build_driver("icloud-production").is_err());
        assert!(build_driver("memory").is_ok());
    }
}
