//! Per-object chunk-arrival signaling.
//!
//! FUSE `read` is the engine's only blocking path: it parks on a per-object
//! condition until the chunks it needs have landed or a timeout elapses.
//! The sync engine signals here after every chunk write, keeping the FUSE
//! handler straight-line code with a single suspension point.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use orchard_core::domain::ObjectId;

struct WaitCell {
    /// Generation counter bumped on every signal; guards against spurious
    /// wakeups without tracking individual chunk indices here.
    generation: Mutex<u64>,
    condvar: Condvar,
}

/// Registry of per-object conditions, keyed by object ID.
#[derive(Default)]
pub struct ChunkWaiters {
    cells: DashMap<ObjectId, Arc<WaitCell>>,
}

impl ChunkWaiters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, id: &ObjectId) -> Arc<WaitCell> {
        self.cells
            .entry(*id)
            .or_insert_with(|| {
                Arc::new(WaitCell {
                    generation: Mutex::new(0),
                    condvar: Condvar::new(),
                })
            })
            .clone()
    }

    /// Wake every reader parked on this object. Called by the cache/engine
    /// after a chunk lands, after promotion, and on invalidation.
    pub fn notify(&self, id: &ObjectId) {
        if let Some(cell) = self.cells.get(id).map(|c| c.clone()) {
            let mut generation = cell.generation.lock().expect("waiter mutex poisoned");
            *generation += 1;
            cell.condvar.notify_all();
        }
    }

    /// Block until `satisfied()` returns true or `timeout` elapses.
    ///
    /// The predicate is re-evaluated after every signal; it typically checks
    /// chunk presence in the state store. Returns false on timeout.
    pub fn wait_until<F>(&self, id: &ObjectId, timeout: Duration, mut satisfied: F) -> bool
    where
        F: FnMut() -> bool,
    {
        if satisfied() {
            return true;
        }
        let cell = self.cell(id);
        let deadline = Instant::now() + timeout;
        let mut generation = cell.generation.lock().expect("waiter mutex poisoned");
        // A signal may have landed between the first check and taking the
        // lock; re-check before parking.
        if satisfied() {
            return true;
        }
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return satisfied(),
            };
            let seen = *generation;
            let (guard, wait_result) = cell
                .condvar
                .wait_timeout_while(generation, remaining, |g| *g == seen)
                .expect("waiter mutex poisoned");
            generation = guard;
            if satisfied() {
                return true;
            }
            if wait_result.timed_out() {
                return false;
            }
        }
    }

    /// Drop the cell for an object that no longer exists.
    pub fn forget(&self, id: &ObjectId) {
        self.cells.remove(id);
    }
}
