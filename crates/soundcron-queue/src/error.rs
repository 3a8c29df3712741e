use thiserror::Error;

use soundcron_core::error::WireError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed job message {entry_id}: {source}")]
    Wire {
        entry_id: String,
        #[source]
        source: WireError,
    },
}

pub type Result<T> = std::result::Result<T, QueueError>;
