//! Deadline timer backing delayed submission.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // earliest deadline on top of the max-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// A single thread that fires callbacks once their deadline has passed.
///
/// Callbacks run on the timer thread and are expected to be short: they
/// hand the real work to a queue.
pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new(name: String) -> Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });

        let shared_clone = shared.clone();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(&shared_clone))
            .map_err(|e| Error::executor(format!("timer spawn failed: {}", e)))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Run `callback` on the timer thread no earlier than `deadline`.
    pub fn schedule<F>(&self, deadline: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry {
            deadline,
            seq,
            callback: Box::new(callback),
        });
        drop(state);

        self.shared.cond.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }
}

fn run(shared: &TimerShared) {
    let mut state = shared.state.lock();

    loop {
        if state.shutdown {
            break;
        }

        let next = state.entries.peek().map(|entry| entry.deadline);
        match next {
            None => shared.cond.wait(&mut state),
            Some(deadline) if deadline <= Instant::now() => {
                if let Some(entry) = state.entries.pop() {
                    MutexGuard::unlocked(&mut state, entry.callback);
                }
            }
            Some(deadline) => {
                shared.cond.wait_until(&mut state, deadline);
            }
        }
    }

    tracing::debug!(dropped = state.entries.len(), "timer stopped");
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_fires_after_deadline() {
        let timer = Timer::new("test-timer".to_string()).unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();

        timer.schedule(start + Duration::from_millis(50), move || {
            tx.send(Instant::now()).unwrap();
        });

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(50));
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let timer = Timer::new("test-timer".to_string()).unwrap();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();

        for (label, delay) in [("late", 60u64), ("early", 20), ("middle", 40)] {
            let tx = tx.clone();
            timer.schedule(now + Duration::from_millis(delay), move || {
                tx.send(label).unwrap();
            });
        }

        let order: Vec<&str> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_equal_deadlines_keep_schedule_order() {
        let timer = Timer::new("test-timer".to_string()).unwrap();
        let (tx, rx) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_millis(20);

        for i in 0..5 {
            let tx = tx.clone();
            timer.schedule(deadline, move || tx.send(i).unwrap());
        }

        let order: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_drop_discards_pending_callbacks() {
        let timer = Timer::new("test-timer".to_string()).unwrap();
        timer.schedule(Instant::now() + Duration::from_secs(3600), || {});
        assert_eq!(timer.pending(), 1);
        drop(timer);
    }
}
