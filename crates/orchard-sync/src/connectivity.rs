//! Process-wide connectivity and pause state.
//!
//! Workers consult a fast-path flag before claiming; the heartbeat task
//! probes reachability while offline and flips the flag back. Auth failures
//! pause the engine outright instead of burning retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orchard_core::domain::CloudId;
use orchard_core::ports::remote::{RemoteAdapter, RemoteError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared connectivity/pause flags, cheap to clone.
#[derive(Clone, Default)]
pub struct Connectivity {
    inner: Arc<Flags>,
}

#[derive(Default)]
struct Flags {
    offline: AtomicBool,
    paused: AtomicBool,
    auth_failed: AtomicBool,
}

impl Connectivity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when workers may claim and run actions.
    #[must_use]
    pub fn can_work(&self) -> bool {
        !self.inner.offline.load(Ordering::Relaxed)
            && !self.inner.paused.load(Ordering::Relaxed)
            && !self.inner.auth_failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        !self.inner.offline.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_auth_failed(&self) -> bool {
        self.inner.auth_failed.load(Ordering::Relaxed)
    }

    /// Record a transient network failure observed by a worker.
    pub fn mark_offline(&self) {
        if !self.inner.offline.swap(true, Ordering::Relaxed) {
            warn!("Connectivity lost, workers backing off");
        }
    }

    pub fn mark_online(&self) {
        if self.inner.offline.swap(false, Ordering::Relaxed) {
            info!("Connectivity restored");
        }
    }

    /// User-requested pause (control API).
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Relaxed);
        info!("Engine paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Relaxed);
        // A resume is also the operator's "credentials are fixed" signal.
        self.inner.auth_failed.store(false, Ordering::Relaxed);
        info!("Engine resumed");
    }

    /// Authentication failed; surface and stop claiming.
    pub fn mark_auth_failed(&self) {
        if !self.inner.auth_failed.swap(true, Ordering::Relaxed) {
            warn!("Authentication failed, engine paused until resume");
        }
    }

    /// Heartbeat loop: while offline, probe the remote root's metadata and
    /// flip back online on the first success.
    pub async fn heartbeat(
        &self,
        remote: Arc<dyn RemoteAdapter>,
        root_cloud_id: CloudId,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if self.is_online() {
                continue;
            }
            match remote.metadata(&root_cloud_id).await {
                Ok(_) => self.mark_online(),
                Err(RemoteError::Auth(_)) => self.mark_auth_failed(),
                Err(_) => {}
            }
        }
    }
}
