use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{CpuPool, Executor, MainThread, Priority, Timer};
use crate::queue::{QueueMode, TaskQueue};
use crate::telemetry::MetricsSnapshot;
use std::sync::{Arc, OnceLock};

struct SharedQueues {
    main: TaskQueue,
    high: TaskQueue,
    normal: TaskQueue,
    low: TaskQueue,
    background: TaskQueue,
}

/// The execution substrate queues run on: a worker pool, the main context
/// and the timer for delayed submission, plus the five shared queues.
///
/// Most programs use the process-wide runtime through [`global`] and the
/// free accessor functions. A separate `Runtime` gives tests and embedders
/// an isolated pool.
pub struct Runtime {
    pool: Arc<CpuPool>,
    main: Arc<MainThread>,
    timer: Arc<Timer>,
    shared: SharedQueues,
    config: Config,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(CpuPool::new(&config)?);
        let main = Arc::new(MainThread::new(
            format!("{}-main", config.thread_name_prefix),
            config.panic_strategy,
        )?);
        let timer = Arc::new(Timer::new(format!("{}-timer", config.thread_name_prefix))?);

        let shared_on = |priority: Priority, label: &str| {
            TaskQueue::on(
                pool.clone(),
                timer.clone(),
                QueueMode::Concurrent,
                priority,
                Some(label.to_string()),
            )
        };

        let shared = SharedQueues {
            main: TaskQueue::on(
                main.clone(),
                timer.clone(),
                QueueMode::Serial,
                Priority::High,
                Some("main".to_string()),
            ),
            high: shared_on(Priority::High, "global-high"),
            normal: shared_on(Priority::Normal, "global-default"),
            low: shared_on(Priority::Low, "global-low"),
            background: shared_on(Priority::Background, "global-background"),
        };

        tracing::debug!(threads = pool.num_threads(), "runtime started");

        Ok(Self {
            pool,
            main,
            timer,
            shared,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn num_threads(&self) -> usize {
        self.pool.num_threads()
    }

    /// New queue bound to this runtime's worker pool.
    pub fn queue(&self, mode: QueueMode, label: Option<String>) -> TaskQueue {
        TaskQueue::on(
            self.pool.clone(),
            self.timer.clone(),
            mode,
            Priority::Normal,
            label,
        )
    }

    pub fn serial_queue(&self) -> TaskQueue {
        self.queue(QueueMode::Serial, None)
    }

    pub fn concurrent_queue(&self) -> TaskQueue {
        self.queue(QueueMode::Concurrent, None)
    }

    /// Serial queue whose tasks all run on the dedicated main context.
    pub fn main_queue(&self) -> &TaskQueue {
        &self.shared.main
    }

    /// Shared concurrent queue for `priority`.
    pub fn global_queue(&self, priority: Priority) -> &TaskQueue {
        match priority {
            Priority::High => &self.shared.high,
            Priority::Normal => &self.shared.normal,
            Priority::Low => &self.shared.low,
            Priority::Background => &self.shared.background,
        }
    }

    /// Whether the caller is running on this runtime's main context.
    pub fn is_main_context(&self) -> bool {
        self.main.is_current()
    }

    /// Tasks handed to the pool that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        self.pool.pending_tasks()
    }

    /// Number of pool tasks that unwound.
    pub fn panic_count(&self) -> usize {
        self.pool.panic_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pool.metrics().snapshot()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pool", &self.pool)
            .field("main_concurrency", &self.main.concurrency())
            .field("timer", &self.timer)
            .finish()
    }
}

// Process-wide runtime, never torn down
static GLOBAL_RUNTIME: OnceLock<Runtime> = OnceLock::new();

pub fn init() -> Result<()> {
    init_with_config(Config::default())
}

/// Install the process-wide runtime with `config`.
///
/// Fails with [`Error::AlreadyInitialized`] once the global runtime exists,
/// including when it was started implicitly by an earlier queue operation.
pub fn init_with_config(config: Config) -> Result<()> {
    if GLOBAL_RUNTIME.get().is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let rt = Runtime::new(config)?;
    GLOBAL_RUNTIME
        .set(rt)
        .map_err(|_| Error::AlreadyInitialized)
}

/// The process-wide runtime, started with the default config on first use.
pub fn global() -> &'static Runtime {
    GLOBAL_RUNTIME.get_or_init(|| {
        Runtime::new(Config::default())
            .unwrap_or_else(|e| panic!("failed to start the default runtime: {}", e))
    })
}

pub fn main_queue() -> &'static TaskQueue {
    global().main_queue()
}

pub fn global_queue() -> &'static TaskQueue {
    global().global_queue(Priority::Normal)
}

pub fn high_priority_global_queue() -> &'static TaskQueue {
    global().global_queue(Priority::High)
}

pub fn low_priority_global_queue() -> &'static TaskQueue {
    global().global_queue(Priority::Low)
}

pub fn background_priority_global_queue() -> &'static TaskQueue {
    global().global_queue(Priority::Background)
}

pub fn global_queue_with_priority(priority: Priority) -> &'static TaskQueue {
    global().global_queue(priority)
}

pub fn is_main_context() -> bool {
    global().is_main_context()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CountingSemaphore;
    use std::time::Duration;

    fn runtime(threads: usize) -> Runtime {
        Runtime::new(Config::builder().num_threads(threads).build().unwrap()).unwrap()
    }

    #[test]
    fn test_custom_config() {
        let rt = runtime(2);
        assert_eq!(rt.num_threads(), 2);
        assert_eq!(rt.config().worker_threads(), 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            num_threads: Some(0),
            ..Config::default()
        };
        assert!(matches!(Runtime::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_shared_queues_have_fixed_modes() {
        let rt = runtime(2);

        assert_eq!(rt.main_queue().mode(), QueueMode::Serial);
        for priority in [Priority::High, Priority::Normal, Priority::Low, Priority::Background] {
            let queue = rt.global_queue(priority);
            assert_eq!(queue.mode(), QueueMode::Concurrent);
            assert_eq!(queue.priority(), priority);
        }
        assert_ne!(rt.global_queue(Priority::High), rt.global_queue(Priority::Low));
    }

    #[test]
    fn test_main_queue_runs_on_main_context() {
        let rt = runtime(2);
        let mut on_main = false;

        rt.main_queue().submit_and_wait(|| on_main = rt.is_main_context());

        assert!(on_main);
        assert!(!rt.is_main_context());
    }

    #[test]
    fn test_global_init_after_first_use_fails() {
        let _ = global();
        assert!(matches!(init(), Err(Error::AlreadyInitialized)));
    }

    #[test]
    fn test_global_accessors_are_stable() {
        assert_eq!(global_queue(), global_queue());
        assert_eq!(main_queue(), main_queue());
        assert_eq!(high_priority_global_queue(), global_queue_with_priority(Priority::High));
        assert_ne!(low_priority_global_queue(), background_priority_global_queue());

        let sem = CountingSemaphore::new(0);
        let signal = sem.clone();
        background_priority_global_queue().submit(move || {
            signal.signal();
        });
        assert!(sem.wait_timeout(Duration::from_secs(5)));
    }
}
