//! Runtime configuration for the protocol thread and its allocation pools.

use std::time::Duration;

/// Configuration for the marshaling layer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of request messages that may be in flight at once. A call made
    /// while the pool is exhausted fails with [`crate::Error::NoMemory`].
    pub message_pool: usize,
    /// Number of received segments that may be buffered across all
    /// endpoints. When exhausted, arriving data is refused back to the
    /// engine, which keeps it and redelivers later.
    pub queue_entry_pool: usize,
    /// Period at which the protocol thread drives the engine's timers.
    pub tick_interval: Duration,
    /// Name given to the protocol thread.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            message_pool: 256,
            queue_entry_pool: 4096,
            tick_interval: Duration::from_millis(250),
            thread_name: "tcpip".to_string(),
        }
    }
}
