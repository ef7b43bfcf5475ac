use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SemaphoreState {
    // units nobody is waiting for yet
    available: usize,
    // threads blocked in wait() that no signal has been assigned to
    waiters: usize,
    // units handed directly to blocked waiters but not yet picked up
    handoffs: usize,
}

#[derive(Debug, Default)]
struct SemaphoreInner {
    state: Mutex<SemaphoreState>,
    cond: Condvar,
}

/// Counting semaphore with blocking and bounded waits.
///
/// Cloning yields another handle to the same count.
#[derive(Debug, Clone, Default)]
pub struct CountingSemaphore {
    inner: Arc<SemaphoreInner>,
}

impl CountingSemaphore {
    pub fn new(value: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                state: Mutex::new(SemaphoreState {
                    available: value,
                    ..SemaphoreState::default()
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Increment the count. Returns `true` if the unit went to a blocked waiter.
    pub fn signal(&self) -> bool {
        let mut state = self.inner.state.lock();

        if state.waiters > 0 {
            state.waiters -= 1;
            state.handoffs += 1;
            drop(state);
            self.inner.cond.notify_one();
            true
        } else {
            state.available += 1;
            false
        }
    }

    /// Decrement the count, blocking until a unit is available.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();

        if state.available > 0 {
            state.available -= 1;
            return;
        }

        state.waiters += 1;
        while state.handoffs == 0 {
            self.inner.cond.wait(&mut state);
        }
        state.handoffs -= 1;
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns `false` on timeout, in which case the count is left untouched.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => {
                self.wait();
                return true;
            }
        };

        let mut state = self.inner.state.lock();

        if state.available > 0 {
            state.available -= 1;
            return true;
        }

        state.waiters += 1;
        while state.handoffs == 0 {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        if state.handoffs > 0 {
            // a signal may have landed right as the deadline passed
            state.handoffs -= 1;
            true
        } else {
            state.waiters -= 1;
            false
        }
    }

    /// Units currently available without blocking.
    pub fn value(&self) -> usize {
        self.inner.state.lock().available
    }
}
