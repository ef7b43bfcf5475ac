use crate::queue::TaskQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct GroupState {
    outstanding: usize,
    // bumped on every transition to zero
    epoch: u64,
    on_zero: Vec<Callback>,
}

impl GroupState {
    fn settled_since(&self, epoch: u64) -> bool {
        self.outstanding == 0 || self.epoch != epoch
    }
}

#[derive(Default)]
struct GroupInner {
    state: Mutex<GroupState>,
    cond: Condvar,
}

/// Join point for a dynamic set of outstanding tasks.
///
/// Every [`enter`](Self::enter) must be matched by exactly one
/// [`leave`](Self::leave). A group may be reused once its count is back at
/// zero. Cloning yields another handle to the same count.
#[derive(Clone, Default)]
pub struct CompletionGroup {
    inner: Arc<GroupInner>,
}

impl CompletionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        self.inner.state.lock().outstanding += 1;
    }

    /// # Panics
    ///
    /// Panics if called more times than [`enter`](Self::enter).
    pub fn leave(&self) {
        let mut state = self.inner.state.lock();

        if state.outstanding == 0 {
            drop(state);
            panic!("CompletionGroup::leave called without a matching enter");
        }

        state.outstanding -= 1;
        if state.outstanding > 0 {
            return;
        }

        state.epoch = state.epoch.wrapping_add(1);
        let callbacks = std::mem::take(&mut state.on_zero);
        drop(state);

        self.inner.cond.notify_all();
        for callback in callbacks {
            callback();
        }
    }

    /// Block until the outstanding count drops to zero.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        let epoch = state.epoch;

        while !state.settled_since(epoch) {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Block for at most `timeout`. Returns whether the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => {
                self.wait();
                return true;
            }
        };

        let mut state = self.inner.state.lock();
        let epoch = state.epoch;

        while !state.settled_since(epoch) {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.settled_since(epoch);
            }
        }

        true
    }

    /// Submit `task` to `queue` once the outstanding count next reaches zero,
    /// or right away if it already is zero.
    pub fn notify<F>(&self, queue: &TaskQueue, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = queue.clone();
        self.on_zero(move || queue.submit(task));
    }

    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    pub(crate) fn on_zero<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();

        if state.outstanding == 0 {
            drop(state);
            callback();
        } else {
            state.on_zero.push(Box::new(callback));
        }
    }

    /// Enter now and leave when the returned guard drops, unwinding included.
    pub(crate) fn enter_scoped(&self) -> LeaveGuard {
        self.enter();
        LeaveGuard {
            group: self.clone(),
        }
    }
}

impl std::fmt::Debug for CompletionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionGroup")
            .field("outstanding", &state.outstanding)
            .field("pending_notifications", &state.on_zero.len())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct LeaveGuard {
    group: CompletionGroup,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.group.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_wait_on_idle_group_returns_immediately() {
        let group = CompletionGroup::new();
        group.wait();
        assert!(group.wait_timeout(Duration::from_millis(0)));
    }

    #[test]
    fn test_wait_returns_after_last_leave() {
        let group = CompletionGroup::new();
        let left = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            group.enter();
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let group = group.clone();
                let left = left.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5 * i));
                    left.fetch_add(1, Ordering::SeqCst);
                    group.leave();
                })
            })
            .collect();

        group.wait();
        assert_eq!(left.load(Ordering::SeqCst), 8);
        assert_eq!(group.outstanding(), 0);

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_wait_timeout_expires_while_outstanding() {
        let group = CompletionGroup::new();
        group.enter();

        let start = Instant::now();
        assert!(!group.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));

        group.leave();
        assert!(group.wait_timeout(Duration::from_millis(50)));
    }

    #[test]
    fn test_on_zero_fires_once_per_crossing() {
        let group = CompletionGroup::new();
        let fired = Arc::new(AtomicUsize::new(0));

        group.enter();
        let counter = fired.clone();
        group.on_zero(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        group.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // reuse: the old registration must not fire again
        group.enter();
        group.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_zero_runs_immediately_when_idle() {
        let group = CompletionGroup::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        group.on_zero(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_leaves_on_unwind() {
        let group = CompletionGroup::new();
        let cloned = group.clone();

        let result = thread::spawn(move || {
            let _guard = cloned.enter_scoped();
            panic!("task failed");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "without a matching enter")]
    fn test_unbalanced_leave_panics() {
        CompletionGroup::new().leave();
    }
}
