//! Serial and concurrent task queues.
//!
//! A [`TaskQueue`] decides *when* a submitted closure may start; the worker
//! pool (or the main context) decides *where*. Serial queues run one task at
//! a time in submission order. Concurrent queues run plain tasks in parallel
//! and use barriers as total ordering points.
//!
//! ```no_run
//! use dispatchkit::{CompletionGroup, TaskQueue};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let queue = TaskQueue::concurrent();
//! let group = CompletionGroup::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..10 {
//!     let hits = hits.clone();
//!     queue.submit_in_group(move || { hits.fetch_add(1, Ordering::Relaxed); }, &group);
//! }
//!
//! group.wait();
//! assert_eq!(hits.load(Ordering::Relaxed), 10);
//! ```

mod admission;

use crate::executor::{Executor, PanicSlot, Priority, Task, Timer};
use crate::sync::{CompletionGroup, CountingSemaphore, LeaveGuard};
use admission::{Admission, Admitted, BoxedJob, Job};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static QUEUE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // queue whose task is executing on this thread, if any
    static CURRENT_QUEUE: Cell<Option<u64>> = Cell::new(None);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueMode {
    Serial,
    Concurrent,
}

pub(crate) struct QueueInner {
    id: u64,
    label: Option<String>,
    mode: QueueMode,
    priority: Priority,
    executor: Arc<dyn Executor>,
    timer: Arc<Timer>,
    admission: Mutex<Admission>,
}

impl QueueInner {
    fn enqueue(self: &Arc<Self>, job: Job) {
        let ready = {
            let mut admission = self.admission.lock();
            admission.push(job);
            admission.admit(self.mode)
        };
        self.launch(ready);
    }

    fn finish(self: &Arc<Self>, exclusive: bool, barrier: bool) {
        let ready = {
            let mut admission = self.admission.lock();
            admission.complete(exclusive, barrier);
            admission.admit(self.mode)
        };
        self.launch(ready);
    }

    fn launch(self: &Arc<Self>, ready: Vec<Admitted>) {
        for admitted in ready {
            if admitted.barrier {
                tracing::trace!(queue = self.id, "barrier admitted");
            }

            if admitted.inline {
                // the waiting thread takes over the slot
                (admitted.func)();
                continue;
            }

            let completion = Completion {
                queue: self.clone(),
                exclusive: admitted.exclusive,
                barrier: admitted.barrier,
            };
            let func = admitted.func;
            let id = self.id;

            self.executor.dispatch(Task::with_priority(
                move || {
                    // dropped in reverse order: marker first, then completion
                    let _completion = completion;
                    let _marker = CurrentQueueMarker::enter(id);
                    func();
                },
                self.priority,
            ));
        }
    }
}

/// Hands a job's slot back to its queue, even when the job unwinds.
struct Completion {
    queue: Arc<QueueInner>,
    exclusive: bool,
    barrier: bool,
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.queue.finish(self.exclusive, self.barrier);
    }
}

struct CurrentQueueMarker {
    previous: Option<u64>,
}

impl CurrentQueueMarker {
    fn enter(id: u64) -> Self {
        let previous = CURRENT_QUEUE.with(|current| current.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for CurrentQueueMarker {
    fn drop(&mut self) {
        CURRENT_QUEUE.with(|current| current.set(self.previous));
    }
}

/// A queue slot occupied by the calling thread instead of a worker.
struct HeldSlot {
    // field order is drop order: marker first, then completion
    _marker: CurrentQueueMarker,
    _completion: Completion,
}

/// State shared between a blocking iteration and its helper jobs.
struct IterBatch {
    // lifetime erased; see `IterBatch::drain`
    task: *const (dyn Fn(usize) + Sync),
    iterations: usize,
    cursor: AtomicUsize,
    failure: PanicSlot,
    closed: Mutex<bool>,
    active: CompletionGroup,
}

// SAFETY: `task` points at a `Sync` closure and is only dereferenced while
// the submitting thread is blocked in `submit_and_wait_iter`.
unsafe impl Send for IterBatch {}
unsafe impl Sync for IterBatch {}

impl IterBatch {
    /// Register a helper, unless the submitter has already stopped waiting
    /// for helpers.
    fn join(&self) -> Option<LeaveGuard> {
        let closed = self.closed.lock();
        if *closed {
            None
        } else {
            Some(self.active.enter_scoped())
        }
    }

    /// Claim and run indices until none are left.
    ///
    /// Only called by the submitter itself or by a helper holding a guard
    /// from [`join`](Self::join).
    fn drain(&self) {
        // SAFETY: the submitter outlives its own call, and `close` waits for
        // every joined helper before the submitter returns.
        let task = unsafe { &*self.task };
        loop {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed);
            if i >= self.iterations {
                break;
            }
            self.failure.run(|| task(i));
        }
    }

    /// Turn away late helpers and wait for the joined ones.
    fn close(&self) {
        *self.closed.lock() = true;
        self.active.wait();
    }
}

/// Extend a borrowed job to `'static` so it can travel through the queue.
///
/// # Safety
///
/// The caller must block until the job has been consumed (run or dropped)
/// before anything it borrows goes out of scope.
unsafe fn erase_lifetime<'a>(job: Box<dyn FnOnce() + Send + 'a>) -> BoxedJob {
    std::mem::transmute::<Box<dyn FnOnce() + Send + 'a>, BoxedJob>(job)
}

/// Handle to a serial or concurrent queue.
///
/// Handles are cheap to clone; clones refer to the same queue and compare
/// equal.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub(crate) fn on(
        executor: Arc<dyn Executor>,
        timer: Arc<Timer>,
        mode: QueueMode,
        priority: Priority,
        label: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: QUEUE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                label,
                mode,
                priority,
                executor,
                timer,
                admission: Mutex::new(Admission::new()),
            }),
        }
    }

    /// New queue on the process-wide runtime.
    pub fn new(mode: QueueMode) -> Self {
        crate::runtime::global().queue(mode, None)
    }

    pub fn labeled<S: Into<String>>(mode: QueueMode, label: S) -> Self {
        crate::runtime::global().queue(mode, Some(label.into()))
    }

    pub fn serial() -> Self {
        Self::new(QueueMode::Serial)
    }

    pub fn concurrent() -> Self {
        Self::new(QueueMode::Concurrent)
    }

    /// Queue `task` for asynchronous execution. Never blocks.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.enqueue(Job::plain(Box::new(task)));
    }

    /// Queue `task` once `delay` has elapsed. Never blocks.
    ///
    /// The task enters the queue at its deadline, so it is ordered after
    /// everything submitted before the deadline passed.
    pub fn submit_after<F>(&self, task: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            self.submit(task);
            return;
        }

        let Some(deadline) = Instant::now().checked_add(delay) else {
            tracing::warn!(queue = self.inner.id, ?delay, "delay out of range, task dropped");
            return;
        };

        let inner = self.inner.clone();
        self.inner.timer.schedule(deadline, move || {
            inner.enqueue(Job::plain(Box::new(task)));
        });
    }

    /// Queue `task` and block until it has run.
    ///
    /// The task keeps its place in the queue: on a serial queue it waits
    /// behind everything submitted earlier. Once admitted it runs on the
    /// calling thread, except on the main queue, which always runs its work
    /// on the main context. A panic in `task` propagates to the caller.
    ///
    /// # Panics
    ///
    /// Panics when called from a task running on this same serial queue,
    /// which could never make progress.
    pub fn submit_and_wait<'a, F>(&self, task: F)
    where
        F: FnOnce() + Send + 'a,
    {
        if self.inner.mode == QueueMode::Serial {
            self.assert_not_current("submit_and_wait");
        }
        self.run_and_wait(Box::new(task), false);
    }

    /// Run `task(i)` for every `i` in `0..iterations` and block until all
    /// invocations returned.
    ///
    /// A concurrent queue spreads the indices over the executor's workers and
    /// the calling thread; a serial queue runs them in order. The first panic
    /// raised by `task` is re-raised in the caller after every index has been
    /// delivered.
    pub fn submit_and_wait_iter<'a, F>(&self, iterations: usize, task: F)
    where
        F: Fn(usize) + Sync + 'a,
    {
        if iterations == 0 {
            return;
        }

        if self.inner.mode == QueueMode::Serial || !self.inner.executor.runs_sync_inline() {
            if self.inner.mode == QueueMode::Serial {
                self.assert_not_current("submit_and_wait_iter");
            }
            let failure = PanicSlot::default();
            let (task, slot) = (&task, &failure);
            self.run_and_wait(
                Box::new(move || {
                    for i in 0..iterations {
                        slot.run(|| task(i));
                    }
                }),
                false,
            );
            failure.propagate();
            return;
        }

        let task = &task as &(dyn Fn(usize) + Sync + 'a) as *const (dyn Fn(usize) + Sync + 'a);
        // SAFETY: only the pointee's lifetime bound changes; `IterBatch`
        // never dereferences it once this call has returned.
        let task = unsafe {
            std::mem::transmute::<
                *const (dyn Fn(usize) + Sync + 'a),
                *const (dyn Fn(usize) + Sync + 'static),
            >(task)
        };
        let batch = Arc::new(IterBatch {
            task,
            iterations,
            cursor: AtomicUsize::new(0),
            failure: PanicSlot::default(),
            closed: Mutex::new(false),
            active: CompletionGroup::new(),
        });

        // the calling thread is one of the `width` participants
        let width = self.inner.executor.concurrency().clamp(1, iterations);
        for _ in 1..width {
            let batch = batch.clone();
            self.submit(move || {
                if let Some(_guard) = batch.join() {
                    batch.drain();
                }
            });
        }

        {
            let _slot = self.acquire(false);
            batch.drain();
        }
        batch.close();
        batch.failure.propagate();
    }

    /// Enter `group` now, and leave it once `task` has returned or unwound.
    pub fn submit_in_group<F>(&self, task: F, group: &CompletionGroup)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = group.enter_scoped();
        self.submit(move || {
            let _guard = guard;
            task();
        });
    }

    /// Submit `task` to this queue when `group` next has nothing outstanding,
    /// or immediately if it is idle already.
    pub fn notify<F>(&self, task: F, group: &CompletionGroup)
    where
        F: FnOnce() + Send + 'static,
    {
        group.notify(self, task);
    }

    /// Queue `task` as a barrier.
    ///
    /// On a concurrent queue it starts after every earlier task finished, and
    /// nothing submitted later starts before it finished. On a serial queue
    /// it is an ordinary submission.
    pub fn submit_barrier<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.enqueue(self.barrier_job(Box::new(task)));
    }

    /// [`submit_barrier`](Self::submit_barrier), then block until it has run.
    ///
    /// # Panics
    ///
    /// Panics when called from a task running on this same queue.
    pub fn submit_barrier_and_wait<'a, F>(&self, task: F)
    where
        F: FnOnce() + Send + 'a,
    {
        self.assert_not_current("submit_barrier_and_wait");
        self.run_and_wait(Box::new(task), true);
    }

    /// Stop starting new tasks. Running tasks are not interrupted.
    ///
    /// Suspensions nest: each call needs its own [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.inner.admission.lock().suspend();
        tracing::trace!(queue = self.inner.id, "queue suspended");
    }

    /// # Panics
    ///
    /// Panics if the queue is not suspended.
    pub fn resume(&self) {
        let ready = {
            let mut admission = self.inner.admission.lock();
            if !admission.resume() {
                drop(admission);
                panic!("TaskQueue::resume called on a queue that is not suspended");
            }
            admission.admit(self.inner.mode)
        };
        tracing::trace!(queue = self.inner.id, released = ready.len(), "queue resumed");
        self.inner.launch(ready);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.admission.lock().is_suspended()
    }

    pub fn mode(&self) -> QueueMode {
        self.inner.mode
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Number of barriers that have completed on this queue.
    pub fn generation(&self) -> u64 {
        self.inner.admission.lock().generation()
    }

    /// Tasks submitted but not started yet.
    pub fn pending(&self) -> usize {
        self.inner.admission.lock().pending()
    }

    /// Whether the calling thread is executing a task of this queue.
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get()) == Some(self.inner.id)
    }

    fn barrier_job(&self, func: BoxedJob) -> Job {
        match self.inner.mode {
            QueueMode::Concurrent => Job::barrier(func),
            QueueMode::Serial => Job::plain(func),
        }
    }

    fn assert_not_current(&self, operation: &str) {
        if self.is_current() {
            panic!(
                "TaskQueue::{} called from a task on the same queue (queue {:?}) would deadlock",
                operation,
                self.label().unwrap_or("<unlabeled>")
            );
        }
    }

    fn run_and_wait<'a>(&self, task: Box<dyn FnOnce() + Send + 'a>, barrier: bool) {
        if !self.inner.executor.runs_sync_inline() {
            self.run_on_executor(task, barrier);
            return;
        }

        // a panic unwinds straight through here; dropping the slot still
        // returns it to the queue
        let _slot = self.acquire(barrier);
        task();
    }

    /// Queue a slot marker and block until the queue admits it. The calling
    /// thread then occupies that slot until the returned guard is dropped.
    fn acquire(&self, barrier: bool) -> HeldSlot {
        let admitted = CountingSemaphore::new(0);
        let signal = admitted.clone();
        let marker: BoxedJob = Box::new(move || {
            signal.signal();
        });

        let job = if barrier {
            self.barrier_job(marker)
        } else {
            Job::plain(marker)
        };
        let exclusive = job.exclusive(self.inner.mode);
        let barrier = job.closes_generation(self.inner.mode);

        self.inner.enqueue(job.inline());
        admitted.wait();

        HeldSlot {
            _marker: CurrentQueueMarker::enter(self.inner.id),
            _completion: Completion {
                queue: self.inner.clone(),
                exclusive,
                barrier,
            },
        }
    }

    /// Run `task` on the executor itself and block until it has run.
    fn run_on_executor<'a>(&self, task: Box<dyn FnOnce() + Send + 'a>, barrier: bool) {
        let done = CountingSemaphore::new(0);
        let failure = Arc::new(PanicSlot::default());
        let (signal, slot) = (done.clone(), failure.clone());

        let job: Box<dyn FnOnce() + Send + 'a> = Box::new(move || {
            slot.run(task);
            signal.signal();
        });

        // SAFETY: `task` is consumed before `done` is signalled, and we block
        // on `done` below, so nothing borrowed by `task` is used after return.
        let job = unsafe { erase_lifetime(job) };
        let job = if barrier {
            self.barrier_job(job)
        } else {
            Job::plain(job)
        };
        self.inner.enqueue(job);

        done.wait();
        failure.propagate();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::serial()
    }
}

impl PartialEq for TaskQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TaskQueue {}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let admission = self.inner.admission.lock();
        f.debug_struct("TaskQueue")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("mode", &self.inner.mode)
            .field("priority", &self.inner.priority)
            .field("pending", &admission.pending())
            .field("in_flight", &admission.in_flight())
            .field("suspended", &admission.is_suspended())
            .finish()
    }
}
