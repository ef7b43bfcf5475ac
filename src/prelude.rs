pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::executor::{PanicStrategy, Priority};
pub use crate::queue::{QueueMode, TaskQueue};
pub use crate::runtime::Runtime;
pub use crate::sync::{CompletionGroup, CountingSemaphore};
pub use crate::{
    background_priority_global_queue, global_queue, high_priority_global_queue, init,
    init_with_config, low_priority_global_queue, main_queue,
};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{Metrics, MetricsSnapshot};
