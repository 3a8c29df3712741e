//! `soundcron-queue`: the work queue between the poller and the workers.
//!
//! Jobs travel over a Redis stream read through a consumer group, so any
//! number of worker processes share the load without seeing the same message
//! twice. The blacklist lives next to it in the same Redis.

pub mod blacklist;
pub mod error;
pub mod print;
pub mod stream;

pub use blacklist::{MemoryBlacklist, RedisBlacklist};
pub use error::{QueueError, Result};
pub use print::PrintDispatcher;
pub use stream::{ensure_group, JobReceiver, RedisJobReceiver, RedisStreamDispatcher};

/// Consumer name for this process: the host name, or `soundcron-worker`.
pub fn default_consumer_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "soundcron-worker".to_string())
}
