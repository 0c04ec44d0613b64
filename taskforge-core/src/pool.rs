//! Worker pool for the resource classes described in §5.
//!
//! The event loop itself never blocks on this pool directly; it asks for a
//! permit before handing a `JobReady` job to [`crate::execution`], and the
//! permit's lifetime governs how many core-consuming jobs run concurrently.
//! `RunsHere` jobs never touch the pool at all.

use crate::job::Resources;
use std::sync::{Arc, Condvar, Mutex};

struct PoolState {
    available: usize,
    capacity: usize,
    /// Set while an `Exclusive` job holds the whole pool, so `AllCores` and
    /// `SingleCore` permits are refused even if `available` looks nonzero
    /// right after the exclusive holder's `available` bookkeeping resets.
    exclusive_held: bool,
}

/// Bounded semaphore sized to the configured core count. `AllCores` asks
/// for the full capacity; `Exclusive` asks for the full capacity and also
/// sets a flag barring any other concurrent acquisition.
pub struct ResourcePool {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// RAII guard; dropping it returns the permit's capacity to the pool.
pub struct PoolPermit {
    pool: Arc<ResourcePool>,
    held: usize,
    exclusive: bool,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock().unwrap();
        state.available += self.held;
        if self.exclusive {
            state.exclusive_held = false;
        }
        self.pool.cond.notify_all();
    }
}

impl ResourcePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(ResourcePool {
            state: Mutex::new(PoolState {
                available: capacity,
                capacity,
                exclusive_held: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Blocks the caller until the requested resource class can be
    /// satisfied. Called from the event-loop thread; the loop only calls
    /// this for jobs it has already decided are ready, so blocking here
    /// just delays dispatch, never correctness.
    pub fn acquire(self: &Arc<Self>, resources: Resources) -> PoolPermit {
        let needed = match resources {
            Resources::SingleCore => 1,
            Resources::AllCores | Resources::Exclusive => {
                let mut state = self.state.lock().unwrap();
                state.capacity
            }
            Resources::RunsHere => 0,
        };

        if needed == 0 {
            return PoolPermit {
                pool: Arc::clone(self),
                held: 0,
                exclusive: false,
            };
        }

        let mut state = self.state.lock().unwrap();
        while state.exclusive_held || state.available < needed {
            state = self.cond.wait(state).unwrap();
        }
        state.available -= needed;
        if matches!(resources, Resources::Exclusive) {
            state.exclusive_held = true;
        }

        PoolPermit {
            pool: Arc::clone(self),
            held: needed,
            exclusive: matches!(resources, Resources::Exclusive),
        }
    }
}
