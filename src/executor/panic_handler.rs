//! Panic containment for queued work.
//!
//! Asynchronous tasks have nobody to report to, so [`PanicHandler`] applies
//! the configured [`PanicStrategy`] on the thread that ran them. Blocking
//! submissions do have a caller: [`PanicSlot`] keeps the first panic of a
//! batch so the waiting thread can re-raise it once the batch is over.

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

type Payload = Box<dyn Any + Send>;

/// What an executor does when a task it runs panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicStrategy {
    /// Log the panic, then abort the process.
    Abort,
    /// Count the panic silently.
    Isolate,
    #[default]
    LogAndContinue,
}

#[derive(Debug)]
pub struct PanicHandler {
    strategy: PanicStrategy,
    panic_count: AtomicUsize,
}

impl PanicHandler {
    pub fn new(strategy: PanicStrategy) -> Self {
        Self {
            strategy,
            panic_count: AtomicUsize::new(0),
        }
    }

    /// Run `f`, containing any panic according to the strategy.
    pub fn run<F, R>(&self, f: F) -> Result<R, PanicInfo>
    where
        F: FnOnce() -> R,
    {
        catch_unwind(AssertUnwindSafe(f)).map_err(|payload| self.report(payload.as_ref()))
    }

    fn report(&self, payload: &(dyn Any + Send)) -> PanicInfo {
        let total = self.panic_count.fetch_add(1, Ordering::Relaxed) + 1;
        let info = PanicInfo::from_payload(payload);

        match self.strategy {
            PanicStrategy::Abort => {
                tracing::error!(message = %info.message, "queued task panicked, aborting");
                std::process::abort();
            }
            PanicStrategy::Isolate => {
                tracing::trace!(total, "queued task panicked");
            }
            PanicStrategy::LogAndContinue => {
                tracing::error!(message = %info.message, total, "queued task panicked");
            }
        }

        info
    }

    pub fn panic_count(&self) -> usize {
        self.panic_count.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) {
        self.panic_count.store(0, Ordering::Relaxed);
    }

    pub fn strategy(&self) -> PanicStrategy {
        self.strategy
    }
}

impl Default for PanicHandler {
    fn default() -> Self {
        Self::new(PanicStrategy::default())
    }
}

#[derive(Debug, Clone)]
pub struct PanicInfo {
    pub message: String,
}

impl PanicInfo {
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());

        Self { message }
    }
}

/// First panic raised by a batch of closures, held for the waiting caller.
#[derive(Default)]
pub(crate) struct PanicSlot {
    first: Mutex<Option<Payload>>,
}

impl PanicSlot {
    /// Run `f`, keeping its panic if it is the first one. Returns whether
    /// `f` returned normally.
    pub fn run<F: FnOnce()>(&self, f: F) -> bool {
        let Err(payload) = catch_unwind(AssertUnwindSafe(f)) else {
            return true;
        };

        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(payload);
        } else {
            tracing::debug!(
                message = %PanicInfo::from_payload(payload.as_ref()).message,
                "further panic in batch dropped"
            );
        }
        false
    }

    pub fn is_set(&self) -> bool {
        self.first.lock().is_some()
    }

    /// Re-raise the kept panic on the calling thread, if there is one.
    pub fn propagate(&self) {
        let payload = self.first.lock().take();
        if let Some(payload) = payload {
            resume_unwind(payload);
        }
    }
}

impl std::fmt::Debug for PanicSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanicSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_counts_and_describes_panic() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);

        let result = handler.run(|| panic!("queue job failed"));

        assert_eq!(result.unwrap_err().message, "queue job failed");
        assert_eq!(handler.panic_count(), 1);
    }

    #[test]
    fn test_run_passes_value_through() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);

        assert_eq!(handler.run(|| 42).unwrap(), 42);
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_formatted_payload_and_reset() {
        let handler = PanicHandler::new(PanicStrategy::LogAndContinue);

        for i in 0..5 {
            let info = handler.run(move || panic!("failure {}", i)).unwrap_err();
            assert_eq!(info.message, format!("failure {}", i));
        }
        assert_eq!(handler.panic_count(), 5);

        handler.reset_count();
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_non_string_payload() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);
        let info = handler.run(|| std::panic::panic_any(7_u32)).unwrap_err();
        assert_eq!(info.message, "<non-string panic payload>");
    }

    #[test]
    fn test_slot_keeps_first_panic_and_keeps_running() {
        let slot = PanicSlot::default();
        let mut ran = Vec::new();

        for i in 0..4 {
            let ok = slot.run(|| {
                ran.push(i);
                if i % 2 == 1 {
                    panic!("index {}", i);
                }
            });
            assert_eq!(ok, i % 2 == 0);
        }
        assert_eq!(ran, vec![0, 1, 2, 3]);
        assert!(slot.is_set());

        let raised = catch_unwind(AssertUnwindSafe(|| slot.propagate())).unwrap_err();
        assert_eq!(PanicInfo::from_payload(raised.as_ref()).message, "index 1");

        // taken: a second propagate is a no-op
        assert!(!slot.is_set());
        slot.propagate();
    }
}
