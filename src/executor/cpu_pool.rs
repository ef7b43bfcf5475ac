use super::panic_handler::PanicHandler;
use super::priority::PriorityQueue;
use super::task::{Priority, Task};
use super::worker::{Worker, WorkerId};
use super::Executor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::telemetry::Metrics;
use crossbeam_deque::Injector;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[cfg(target_os = "linux")]
fn pin_thread_to_core(core_id: usize) {
    let cores = num_cpus::get().max(1);
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id % cores, &mut cpuset);
        let result = libc::sched_setaffinity(
            0, // current thread
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        );
        if result != 0 {
            tracing::warn!(
                thread = thread::current().name().unwrap_or("unknown"),
                core = core_id,
                "failed to pin worker to core"
            );
        }
    }
}

/// State shared between the pool handle and its workers.
pub(crate) struct PoolShared {
    pub injector: Injector<Task>,
    pub priority_queue: PriorityQueue,
    pub shutdown: AtomicBool,
    pub pending_tasks: AtomicUsize,
    pub panic_handler: PanicHandler,
    pub metrics: Metrics,
}

/// Work-stealing thread pool that every queue ultimately runs on.
pub struct CpuPool {
    workers: Vec<WorkerHandle>,
    shared: Arc<PoolShared>,
    num_threads: usize,
    next_wake: AtomicUsize,
}

struct WorkerHandle {
    id: WorkerId,
    thread: Option<JoinHandle<()>>,
    unparker: thread::Thread,
}

impl CpuPool {
    pub fn new(config: &Config) -> Result<Self> {
        let num_threads = config.worker_threads();
        if num_threads == 0 {
            return Err(Error::config("need at least 1 thread"));
        }

        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            priority_queue: PriorityQueue::new(),
            shutdown: AtomicBool::new(false),
            pending_tasks: AtomicUsize::new(0),
            panic_handler: PanicHandler::new(config.panic_strategy),
            metrics: Metrics::new(),
        });

        let mut workers = Vec::with_capacity(num_threads);
        let mut stealers = Vec::with_capacity(num_threads);

        for id in 0..num_threads {
            let worker = Worker::new(id);
            stealers.push(worker.local_queue.stealer());
            workers.push(worker);
        }

        let mut handles = Vec::with_capacity(num_threads);

        for worker in workers {
            let id = worker.id;
            let stealers_clone = stealers.clone();
            let shared_clone = shared.clone();
            let name = format!("{}-{}", config.thread_name_prefix, id);

            let mut builder = thread::Builder::new().name(name);

            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let pin_workers = config.pin_workers;
            let spawned = builder.spawn(move || {
                #[cfg(target_os = "linux")]
                if pin_workers {
                    pin_thread_to_core(id);
                }
                #[cfg(not(target_os = "linux"))]
                let _ = pin_workers;

                worker.run(stealers_clone, shared_clone);
            });

            let thread = match spawned {
                Ok(thread) => thread,
                Err(e) => {
                    // stop whatever already started before reporting
                    shared.shutdown.store(true, Ordering::Release);
                    for handle in &mut handles {
                        stop_worker(handle);
                    }
                    return Err(Error::executor(format!("spawn failed: {}", e)));
                }
            };

            let unparker = thread.thread().clone();

            handles.push(WorkerHandle {
                id,
                thread: Some(thread),
                unparker,
            });
        }

        tracing::debug!(
            threads = num_threads,
            prefix = %config.thread_name_prefix,
            "worker pool started"
        );

        Ok(Self {
            workers: handles,
            shared,
            num_threads,
            next_wake: AtomicUsize::new(0),
        })
    }

    pub(crate) fn submit(&self, task: Task) {
        self.shared.pending_tasks.fetch_add(1, Ordering::Relaxed);

        if task.priority == Priority::Normal {
            // normal priority goes to the injector for work stealing
            self.shared.injector.push(task);
        } else {
            self.shared.priority_queue.push(task);
        }

        // Wake up a worker
        let next = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.num_threads;
        if let Some(worker) = self.workers.get(next) {
            worker.unparker.unpark();
        }
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::new(f));
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.pending_tasks.load(Ordering::Relaxed)
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn panic_count(&self) -> usize {
        self.shared.panic_handler.panic_count()
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    pub fn shutdown(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        for worker in &mut self.workers {
            stop_worker(worker);
        }

        tracing::debug!(threads = self.num_threads, "worker pool stopped");
    }
}

fn stop_worker(worker: &mut WorkerHandle) {
    // wake it up to check the shutdown flag
    worker.unparker.unpark();

    if let Some(thread) = worker.thread.take() {
        // the last pool handle may be released by a task running on this worker
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::warn!(worker = worker.id, "worker thread terminated abnormally");
        }
    }
}

impl Executor for CpuPool {
    fn dispatch(&self, task: Task) {
        self.submit(task);
    }

    fn concurrency(&self) -> usize {
        self.num_threads
    }
}

impl std::fmt::Debug for CpuPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuPool")
            .field("num_threads", &self.num_threads)
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
