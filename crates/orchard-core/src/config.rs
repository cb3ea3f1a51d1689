//! Configuration for the Orchard daemon.
//!
//! Loaded from a JSON file at `~/.config/orchard/config.json`, with typed
//! defaults and a validation pass that reports every problem at once.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Conflict resolution policy applied by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Displace the remote version and upload the local bytes.
    #[default]
    LocalWins,
    /// Discard local intent and pull the remote version.
    RemoteWins,
    /// Leave the object in conflict for the control API to resolve.
    Manual,
}

impl ConflictPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LocalWins => "local_wins",
            ConflictPolicy::RemoteWins => "remote_wins",
            ConflictPolicy::Manual => "manual",
        }
    }
}

/// What a denied thumbnailer read receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenylistResponse {
    /// Return a zero-filled buffer of the requested length.
    #[default]
    ZeroFill,
    /// Return `EIO`.
    IoError,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the projected filesystem is mounted.
    pub mount_point: PathBuf,
    /// Root of the on-disk content cache.
    pub cache_root: PathBuf,
    /// Path of the SQLite state database.
    pub db_path: PathBuf,
    /// Files below this size use full download; at or above, sparse chunks.
    pub small_file_threshold_bytes: u64,
    /// Fixed block size for sparse materialization; must be a power of two.
    pub chunk_size_bytes: u64,
    /// Eviction ceiling for the cache.
    pub cache_max_bytes: u64,
    /// Parallel workers for uploads/downloads/chunks.
    pub worker_count_io: usize,
    /// Workers for short, latency-sensitive metadata actions.
    pub worker_count_meta: usize,
    /// Executable names whose reads are suppressed without download.
    pub thumbnailer_denylist: Vec<String>,
    /// What a suppressed read returns.
    pub thumbnailer_response: DenylistResponse,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_retries: u32,
    /// How long a FUSE read waits for a missing chunk before `EIO`.
    pub chunk_read_timeout_ms: u64,
    pub conflict_policy: ConflictPolicy,
    /// Loopback port of the control/query API.
    pub control_port: u16,
    /// Tracing filter, e.g. `info` or `orchard_sync=debug,info`.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
        let cache = dirs::cache_dir()
            .unwrap_or_else(|| home.join(".cache"))
            .join("orchard");
        Self {
            mount_point: home.join("iCloud"),
            cache_root: cache.clone(),
            db_path: cache.join("db.sqlite"),
            small_file_threshold_bytes: 32 * 1024 * 1024,
            chunk_size_bytes: 8 * 1024 * 1024,
            cache_max_bytes: 10 * 1024 * 1024 * 1024,
            worker_count_io: 4,
            worker_count_meta: 1,
            thumbnailer_denylist: vec![
                "ffmpeg-thumbnailer".to_string(),
                "totem-video-thumbnailer".to_string(),
                "evince-thumbnailer".to_string(),
            ],
            thumbnailer_response: DenylistResponse::ZeroFill,
            retry_base_ms: 500,
            retry_max_ms: 60_000,
            max_retries: 5,
            chunk_read_timeout_ms: 60_000,
            conflict_policy: ConflictPolicy::LocalWins,
            control_port: 7641,
            log_filter: "info".to_string(),
        }
    }
}

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Offending field, e.g. `"chunk_size_bytes"`.
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Platform default path: `$XDG_CONFIG_HOME/orchard/config.json`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("orchard")
            .join("config.json")
    }

    /// Validate and return every problem found; empty means valid.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !self.chunk_size_bytes.is_power_of_two() {
            errors.push(ValidationError {
                field: "chunk_size_bytes".into(),
                message: format!("must be a power of two, got {}", self.chunk_size_bytes),
            });
        }
        if self.chunk_size_bytes == 0 {
            errors.push(ValidationError {
                field: "chunk_size_bytes".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.small_file_threshold_bytes < self.chunk_size_bytes {
            errors.push(ValidationError {
                field: "small_file_threshold_bytes".into(),
                message: "must be at least one chunk".into(),
            });
        }
        if self.worker_count_io == 0 {
            errors.push(ValidationError {
                field: "worker_count_io".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.worker_count_meta == 0 {
            errors.push(ValidationError {
                field: "worker_count_meta".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.retry_base_ms == 0 {
            errors.push(ValidationError {
                field: "retry_base_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.retry_max_ms < self.retry_base_ms {
            errors.push(ValidationError {
                field: "retry_max_ms".into(),
                message: "must be at least retry_base_ms".into(),
            });
        }
        if self.chunk_read_timeout_ms == 0 {
            errors.push(ValidationError {
                field: "chunk_read_timeout_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.cache_max_bytes == 0 {
            errors.push(ValidationError {
                field: "cache_max_bytes".into(),
                message: "must be greater than 0".into(),
            });
        }

        errors
    }
}
