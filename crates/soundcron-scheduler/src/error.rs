use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The cron text could not be parsed.
    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// Asked for zero upcoming occurrences.
    #[error("Occurrence count must be greater than 0")]
    InvalidCount,

    /// No SoundCron with the given ID exists in the store.
    #[error("SoundCron not found: {id}")]
    SoundCronNotFound { id: String },

    /// Another live SoundCron in the guild already uses this name.
    #[error("SoundCron {name:?} already exists in guild {guild_id}")]
    DuplicateName { guild_id: String, name: String },

    /// Saving would push the guild over its audio storage allowance.
    #[error("Storage limit exceeded: requested {requested}, current {current}, max {max}")]
    QuotaExceeded { requested: i64, current: i64, max: i64 },

    /// A stored timestamp could not be parsed back.
    #[error("Corrupt timestamp in store: {0}")]
    CorruptTimestamp(String),

    /// A collaborator (blacklist, dispatcher) failed.
    #[error(transparent)]
    Core(#[from] soundcron_core::CoreError),
}

impl SchedulerError {
    /// Validation failures are shown to the requesting user; everything else
    /// is an internal error.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidCronExpression { .. }
                | SchedulerError::DuplicateName { .. }
                | SchedulerError::QuotaExceeded { .. }
                | SchedulerError::SoundCronNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
