//! The single designated execution context behind the main queue.

use super::panic_handler::{PanicHandler, PanicStrategy};
use super::task::Task;
use super::Executor;
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Sender};
use std::thread::{self, JoinHandle, ThreadId};

/// One long-lived thread that runs every job handed to it, in arrival order.
pub(crate) struct MainThread {
    sender: Option<Sender<Task>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl MainThread {
    pub fn new(name: String, strategy: PanicStrategy) -> Result<Self> {
        let (sender, receiver) = unbounded::<Task>();

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let handler = PanicHandler::new(strategy);
                for task in receiver.iter() {
                    let _ = handler.run(|| task.execute());
                }
                tracing::debug!("main context stopped");
            })
            .map_err(|e| Error::executor(format!("main context spawn failed: {}", e)))?;

        Ok(Self {
            sender: Some(sender),
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    /// Whether the caller is running on this context.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Executor for MainThread {
    fn dispatch(&self, task: Task) {
        if let Some(sender) = &self.sender {
            // only fails once the thread is gone, and then nothing can run it
            let _ = sender.send(task);
        }
    }

    fn concurrency(&self) -> usize {
        1
    }

    // work for this context must run on it, whoever is waiting
    fn runs_sync_inline(&self) -> bool {
        false
    }
}

impl Drop for MainThread {
    fn drop(&mut self) {
        // closing the channel ends the receive loop
        self.sender.take();

        if let Some(thread) = self.thread.take() {
            if !self.is_current() {
                let _ = thread.join();
            }
        }
    }
}

impl std::fmt::Debug for MainThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThread")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}
