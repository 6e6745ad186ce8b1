//! Engine configuration.

use std::time::Duration;

/// Tuning knobs for the engine and its scheduler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of times a retryable node failure will be retried.
    /// A node's `config.max_retries` overrides it.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
    /// Deadline for nodes that do not set `config.timeout_ms`.
    pub default_node_timeout: Option<Duration>,
    /// Capacity of the worker → decision loop event channel.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            default_node_timeout: None,
            event_channel_capacity: 64,
        }
    }
}
