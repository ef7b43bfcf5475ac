//! dispatchkit - serial and concurrent task queues for Rust
//!
//! A small concurrency toolkit built from three cooperating primitives:
//!
//! - [`TaskQueue`]: serial queues run tasks one at a time in submission
//!   order; concurrent queues run them in parallel and accept barriers that
//!   act as total ordering points.
//! - [`CompletionGroup`]: joins a dynamic set of outstanding tasks, with
//!   blocking waits and queue notifications on completion.
//! - [`CountingSemaphore`]: classic wait/signal with bounded waits.
//!
//! # Quick Start
//!
//! ```no_run
//! use dispatchkit::prelude::*;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let queue = TaskQueue::concurrent();
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..100 {
//!     let counter = counter.clone();
//!     queue.submit(move || { counter.fetch_add(1, Ordering::Relaxed); });
//! }
//!
//! // every task submitted above has finished when the barrier runs
//! let mut seen = 0;
//! queue.submit_barrier_and_wait(|| seen = counter.load(Ordering::Relaxed));
//! assert_eq!(seen, 100);
//!
//! let done = CountingSemaphore::new(0);
//! let signal = done.clone();
//! dispatchkit::main_queue().submit_after(move || { signal.signal(); }, Duration::from_millis(10));
//! done.wait();
//! ```
//!
//! All queues execute on a shared work-stealing pool that is started on
//! first use. Call [`init_with_config`] before that to size it explicitly.

// Lint configuration
#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod queue;
pub mod runtime;
pub mod sync;
pub mod telemetry;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use executor::{PanicStrategy, Priority};
pub use queue::{QueueMode, TaskQueue};
pub use runtime::{
    background_priority_global_queue, global_queue, global_queue_with_priority,
    high_priority_global_queue, init, init_with_config, is_main_context,
    low_priority_global_queue, main_queue, Runtime,
};
pub use sync::{CompletionGroup, CountingSemaphore};

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_group_and_semaphore_compose_with_queue() {
        let rt = Runtime::new(Config::builder().num_threads(2).build().unwrap()).unwrap();
        let queue = rt.concurrent_queue();
        let group = CompletionGroup::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = log.clone();
            queue.submit_in_group(move || log.lock().push(i), &group);
        }

        let done = CountingSemaphore::new(0);
        let signal = done.clone();
        let seen = log.clone();
        queue.notify(
            move || {
                assert_eq!(seen.lock().len(), 10);
                signal.signal();
            },
            &group,
        );

        assert!(done.wait_timeout(Duration::from_secs(5)));
        assert_eq!(group.outstanding(), 0);
    }
}
