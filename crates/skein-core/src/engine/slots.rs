//! The bounded pool of KV-cache sequence slots.
//!
//! Submission acquires a slot before a job reaches the scheduler, so the
//! number of live jobs can never exceed the context's parallel-sequence
//! capacity; callers queue FIFO on the internal semaphore when the pool is
//! exhausted.
//!
//! The pool itself never touches the model context. The scheduler wipes a
//! slot's KV over `[0, +inf)` immediately before calling [`SlotPool::release`]
//! (and defensively before first use), which keeps the wipe-before-reuse
//! contract while the backend stays exclusively owned by the scheduler loop.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::engine::backend::SlotId;
use crate::engine::errors::EngineError;

#[derive(Clone)]
pub(crate) struct SlotPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    semaphore: Semaphore,
    state: Mutex<PoolState>,
    capacity: usize,
}

struct PoolState {
    free: VecDeque<SlotId>,
    in_use: HashSet<SlotId>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Semaphore::new(capacity),
                state: Mutex::new(PoolState {
                    free: (0..capacity as SlotId).collect(),
                    in_use: HashSet::with_capacity(capacity),
                }),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Acquire a slot, waiting FIFO until one is free.
    ///
    /// Returns [`EngineError::ShuttingDown`] once [`SlotPool::shutdown`] has
    /// been called.
    pub async fn acquire(&self) -> Result<SlotId, EngineError> {
        let permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        // The id travels with the job; the permit is restored by `release`.
        permit.forget();
        let mut state = self.inner.state.lock().expect("slot pool lock poisoned");
        let id = state.free.pop_front().expect("semaphore/pool out of sync");
        state.in_use.insert(id);
        Ok(id)
    }

    /// Return a slot to the pool. Releasing a slot that is not in use is a
    /// no-op.
    pub fn release(&self, slot: SlotId) {
        let mut state = self.inner.state.lock().expect("slot pool lock poisoned");
        if state.in_use.remove(&slot) {
            state.free.push_back(slot);
            drop(state);
            self.inner.semaphore.add_permits(1);
        }
    }

    /// Wake every blocked acquirer with a shutdown signal.
    pub fn shutdown(&self) {
        self.inner.semaphore.close();
    }
}
