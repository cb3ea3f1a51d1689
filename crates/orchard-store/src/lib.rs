//! Persistent state store for Orchard.
//!
//! Owns every row: objects, shadows, cache presence, chunk presence, and the
//! durable action queue. All compound state changes execute as short
//! serializable transactions; long-running I/O never happens inside one.
//!
//! The [`StateStore`] is a thin handle over a SQLite pool (WAL mode);
//! readers run in parallel, writers serialize behind the busy timeout.

mod objects;
mod pool;
mod presence;
mod queue;
mod row;

pub use pool::DatabasePool;
pub use queue::{BackoffConfig, WorkerClass};

use sqlx::SqlitePool;
use thiserror::Error;

use orchard_core::domain::errors::DomainError;

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Pool could not be opened or configured.
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Underlying SQLite error.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// A row could not be mapped back to a domain type.
    #[error("Row decode failed: {0}")]
    Decode(String),

    /// The requested object/shadow/action does not exist.
    #[error("Not found")]
    NotFound,

    /// Domain-level rejection (uniqueness, invalid transition, bad name).
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Handle to the state store. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Wrap an initialized pool.
    #[must_use]
    pub fn new(pool: &DatabasePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// The underlying pool, for callers composing their own transactions.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
