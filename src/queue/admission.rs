//! Admission control for a single queue.
//!
//! Jobs wait in submission order. On a concurrent queue every run of plain
//! jobs between two barriers forms a generation: its members start as soon as
//! they reach the front, and a barrier at the front holds back everything
//! behind it until the generation has drained. The barrier then runs alone.
//! A serial queue treats every job like a barrier.
//!
//! An inline job only marks a position in the FIFO. Admitting it hands the
//! slot to a thread that is already waiting for it, which runs its own work
//! and completes the slot itself.

use super::QueueMode;
use std::collections::VecDeque;

pub(crate) type BoxedJob = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Job {
    pub func: BoxedJob,
    pub barrier: bool,
    pub inline: bool,
}

impl Job {
    pub fn plain(func: BoxedJob) -> Self {
        Self {
            func,
            barrier: false,
            inline: false,
        }
    }

    pub fn barrier(func: BoxedJob) -> Self {
        Self {
            func,
            barrier: true,
            inline: false,
        }
    }

    /// Turn the job into a slot marker: `func` runs at admission and must
    /// only wake the thread that will occupy the slot.
    pub fn inline(self) -> Self {
        Self {
            inline: true,
            ..self
        }
    }

    /// Whether the job runs alone once admitted on a queue of `mode`.
    pub fn exclusive(&self, mode: QueueMode) -> bool {
        mode == QueueMode::Serial || self.barrier
    }

    /// Whether completing the job closes a generation on a queue of `mode`.
    pub fn closes_generation(&self, mode: QueueMode) -> bool {
        self.barrier && mode == QueueMode::Concurrent
    }
}

/// A job that has been cleared to start.
pub(crate) struct Admitted {
    pub func: BoxedJob,
    pub exclusive: bool,
    pub barrier: bool,
    pub inline: bool,
}

#[derive(Default)]
pub(crate) struct Admission {
    pending: VecDeque<Job>,
    // plain jobs of the current generation still in flight
    running: usize,
    // a barrier, or any job of a serial queue, is in flight
    exclusive: bool,
    suspend_count: usize,
    // barriers completed so far
    generation: u64,
}

impl Admission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.pending.push_back(job);
    }

    /// Take every job allowed to start right now, in submission order.
    pub fn admit(&mut self, mode: QueueMode) -> Vec<Admitted> {
        let mut ready = Vec::new();

        while self.suspend_count == 0 && !self.exclusive {
            let exclusive = match self.pending.front() {
                Some(job) => job.exclusive(mode),
                None => break,
            };

            if exclusive && self.running > 0 {
                break;
            }

            let Some(job) = self.pending.pop_front() else {
                break;
            };

            if exclusive {
                self.exclusive = true;
            } else {
                self.running += 1;
            }

            ready.push(Admitted {
                exclusive,
                barrier: job.closes_generation(mode),
                inline: job.inline,
                func: job.func,
            });
        }

        ready
    }

    /// Record that an admitted job finished, normally or by unwinding.
    pub fn complete(&mut self, exclusive: bool, barrier: bool) {
        if exclusive {
            debug_assert!(self.exclusive, "exclusive completion without exclusive job");
            self.exclusive = false;
            if barrier {
                self.generation += 1;
            }
        } else {
            debug_assert!(self.running > 0, "completion without running job");
            self.running -= 1;
        }
    }

    pub fn suspend(&mut self) {
        self.suspend_count += 1;
    }

    /// Returns `false` if the queue was not suspended.
    pub fn resume(&mut self) -> bool {
        if self.suspend_count == 0 {
            return false;
        }
        self.suspend_count -= 1;
        true
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.running + usize::from(self.exclusive)
    }
}
