use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed job message: {0}")]
    MalformedMessage(#[from] WireError),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Blacklist error: {0}")]
    Blacklist(String),

    #[error("Membership lookup failed for guild {guild_id}: {reason}")]
    Membership { guild_id: String, reason: String },
}

/// Why a queue message could not be turned into a [`DispatchedJob`](crate::types::DispatchedJob).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// A required field is absent from the message.
    #[error("missing field {0:?}")]
    MissingField(&'static str),

    /// A field is present but is not valid UTF-8 text.
    #[error("field {0:?} is not a string")]
    NotAString(&'static str),

    /// `runAt` is present but is not an RFC 3339 timestamp.
    #[error("invalid runAt {value:?}: {reason}")]
    InvalidRunAt { value: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
