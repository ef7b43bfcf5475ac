//! Blocking synchronization primitives that compose with task queues.

pub mod group;
pub mod semaphore;

pub use group::CompletionGroup;
pub use semaphore::CountingSemaphore;

pub(crate) use group::LeaveGuard;
