use crate::{DispatchStrategy, IggyQueueConfig};

pub const DEFAULT_TASK_NAME: &str = "schedule-execution";

/// Configuration for the dispatcher and its workers
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub strategy: DispatchStrategy,
    /// Direct strategy: runs allowed in flight at once
    pub max_concurrent_runs: usize,
    pub iggy: IggyQueueConfig,
    pub consumer_group: String,
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: DispatchStrategy::Direct,
            max_concurrent_runs: 8,
            iggy: IggyQueueConfig::default(),
            consumer_group: "blockflow-workers".to_string(),
            poll_interval_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `BLOCKFLOW_DISPATCH_STRATEGY` (`direct` | `queue`),
    /// `BLOCKFLOW_TASK_NAME`, `BLOCKFLOW_MAX_CONCURRENT_RUNS` and `IGGY_CONNECTION_STRING`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let task_name = std::env::var("BLOCKFLOW_TASK_NAME").unwrap_or_else(|_| DEFAULT_TASK_NAME.to_string());
        match std::env::var("BLOCKFLOW_DISPATCH_STRATEGY").as_deref() {
            Ok("queue") => config.strategy = DispatchStrategy::Queue { task_name },
            Ok("direct") | Err(_) => {}
            Ok(other) => tracing::warn!("Unknown dispatch strategy {:?}, using direct", other),
        }

        if let Ok(raw) = std::env::var("BLOCKFLOW_MAX_CONCURRENT_RUNS") {
            match raw.parse() {
                Ok(n) => config.max_concurrent_runs = n,
                Err(_) => tracing::warn!("Ignoring BLOCKFLOW_MAX_CONCURRENT_RUNS={:?}: not a number", raw),
            }
        }
        if let Ok(connection_string) = std::env::var("IGGY_CONNECTION_STRING") {
            config.iggy.connection_string = connection_string;
        }
        config
    }
}
