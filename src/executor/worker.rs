// worker thread stuff
use super::cpu_pool::PoolShared;
use super::task::{Priority, Task};
use crossbeam_deque::{Steal, Stealer, Worker as WorkerQueue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type WorkerId = usize;

// stats for each worker
#[derive(Debug)]
pub struct WorkerState {
    pub tasks_executed: AtomicU64,
    pub tasks_stolen: AtomicU64,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            tasks_executed: AtomicU64::new(0),
            tasks_stolen: AtomicU64::new(0),
        }
    }
}

pub(crate) struct Worker {
    pub id: WorkerId,
    pub local_queue: WorkerQueue<Task>,
    pub state: Arc<WorkerState>,
}

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            local_queue: WorkerQueue::new_fifo(),
            state: Arc::new(WorkerState::new()),
        }
    }

    // main loop
    pub fn run(&self, stealers: Vec<Stealer<Task>>, shared: Arc<PoolShared>) {
        let mut backoff_cnt = 0;

        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Some(task) = self.find_task(&stealers, &shared) {
                backoff_cnt = 0;
                self.execute_task(task, &shared);
                shared.pending_tasks.fetch_sub(1, Ordering::Relaxed);
            } else {
                self.backoff(&mut backoff_cnt);
            }
        }

        tracing::debug!(worker = self.id, "worker exiting");
    }

    fn find_task(&self, stealers: &[Stealer<Task>], shared: &PoolShared) -> Option<Task> {
        // 1. high-priority work jumps ahead of everything queued at normal priority
        if let Some(task) = shared.priority_queue.pop_at_most(Priority::High) {
            return Some(task);
        }

        // 2. local queue (best cache locality)
        if let Some(task) = self.local_queue.pop() {
            return Some(task);
        }

        // 3. global injector
        loop {
            match shared.injector.steal_batch_and_pop(&self.local_queue) {
                Steal::Success(task) => {
                    self.note_stolen(shared);
                    return Some(task);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // 4. siblings
        if let Some(task) = self.try_steal_from_workers(stealers, shared) {
            return Some(task);
        }

        // 5. low and background work only runs when nothing else is ready
        shared.priority_queue.pop()
    }

    fn try_steal_from_workers(
        &self,
        stealers: &[Stealer<Task>],
        shared: &PoolShared,
    ) -> Option<Task> {
        use rand::seq::SliceRandom;
        use rand::thread_rng;

        if stealers.len() < 2 {
            return None;
        }

        let mut indices: Vec<usize> = (0..stealers.len()).collect();
        indices.shuffle(&mut thread_rng());

        for &idx in &indices {
            if idx == self.id {
                continue;
            }

            loop {
                match stealers[idx].steal_batch_and_pop(&self.local_queue) {
                    Steal::Success(task) => {
                        self.note_stolen(shared);
                        return Some(task);
                    }
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn note_stolen(&self, shared: &PoolShared) {
        self.state.tasks_stolen.fetch_add(1, Ordering::Relaxed);
        shared.metrics.record_task_stolen();
    }

    fn execute_task(&self, task: Task, shared: &PoolShared) {
        let tid = task.id;
        let start = Instant::now();

        let result = shared.panic_handler.run(|| task.execute());

        let duration_ns = start.elapsed().as_nanos() as u64;

        match result {
            Ok(()) => shared.metrics.record_task_execution(duration_ns),
            Err(_) => {
                tracing::trace!(task = ?tid, worker = self.id, "task unwound");
                shared.metrics.record_task_panic();
            }
        }

        self.state.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    fn backoff(&self, count: &mut u32) {
        const MAX_SPINS: u32 = 10;
        const MAX_YIELDS: u32 = 20;

        *count += 1;

        if *count <= MAX_SPINS {
            let spins = (*count).min(6);
            for _ in 0..(1 << spins) {
                std::hint::spin_loop();
            }
        } else if *count <= MAX_YIELDS {
            thread::yield_now();
        } else {
            thread::park_timeout(Duration::from_micros(100));
        }
    }
}
