use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Notify};
use tracing::{debug, info};

/// System-wide transfer limits shared by every job.
pub struct Throttle {
    /// Held while a file above the bandwidth limit is being copied.
    large_file: AsyncMutex<()>,
    gate: ParallelismGate,
}

impl Throttle {
    pub fn new(max_parallel_jobs: usize) -> Self {
        Self {
            large_file: AsyncMutex::new(()),
            gate: ParallelismGate::new(max_parallel_jobs),
        }
    }

    /// Waits for the large-file lock when `size` exceeds `limit`; smaller
    /// files get `None` and proceed immediately.
    pub async fn large_file_guard(&self, size: u64, limit: u64) -> Option<MutexGuard<'_, ()>> {
        if size <= limit {
            return None;
        }
        debug!("waiting for large-file slot ({} bytes > {})", size, limit);
        Some(self.large_file.lock().await)
    }

    pub fn gate(&self) -> &ParallelismGate {
        &self.gate
    }
}

#[derive(Debug)]
struct GateState {
    capacity: usize,
    in_use: usize,
}

/// Counting semaphore whose capacity can change at runtime.
///
/// Capacity and the number of permits held are tracked separately, so
/// shrinking never revokes a running permit and growing never over-issues:
/// a waiter is admitted only while `in_use < capacity`.
#[derive(Clone)]
pub struct ParallelismGate {
    state: Arc<Mutex<GateState>>,
    released: Arc<Notify>,
}

pub struct GatePermit {
    state: Arc<Mutex<GateState>>,
    released: Arc<Notify>,
}

impl ParallelismGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                capacity: capacity.max(1),
                in_use: 0,
            })),
            released: Arc::new(Notify::new()),
        }
    }

    pub async fn acquire(&self) -> GatePermit {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }

    pub fn try_acquire(&self) -> Option<GatePermit> {
        let mut state = self.state.lock();
        if state.in_use < state.capacity {
            state.in_use += 1;
            Some(GatePermit {
                state: self.state.clone(),
                released: self.released.clone(),
            })
        } else {
            None
        }
    }

    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        {
            let mut state = self.state.lock();
            if state.capacity == capacity {
                return;
            }
            info!("Parallel job slots: {} -> {}", state.capacity, capacity);
            state.capacity = capacity;
        }
        self.released.notify_waiters();
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}
