//! Task execution infrastructure.
//!
//! This module provides the substrate queues run on: the work-stealing CPU
//! pool, the dedicated main context, and the deadline timer used for
//! delayed submission.

pub mod cpu_pool;
pub(crate) mod main_thread;
pub mod panic_handler;
pub(crate) mod priority;
pub mod task;
pub(crate) mod timer;
pub(crate) mod worker;

pub use cpu_pool::CpuPool;
pub use panic_handler::{PanicHandler, PanicInfo, PanicStrategy};
pub(crate) use panic_handler::PanicSlot;
pub use task::Priority;

pub(crate) use main_thread::MainThread;
pub(crate) use task::Task;
pub(crate) use timer::Timer;

/// Something that can run a task on some thread, eventually.
pub(crate) trait Executor: Send + Sync {
    fn dispatch(&self, task: Task);

    /// Upper bound on how many tasks this executor runs at once.
    fn concurrency(&self) -> usize;

    /// Whether a blocking submission may run its closure on the submitting
    /// thread once the queue has admitted it.
    fn runs_sync_inline(&self) -> bool {
        true
    }
}
