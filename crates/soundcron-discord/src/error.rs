/// Errors produced by the Discord adapter.
#[derive(Debug, thiserror::Error)]
pub enum DiscordError {
    #[error("serenity error: {0}")]
    Serenity(#[from] serenity::Error),

    #[error("invalid Discord snowflake {0:?}")]
    InvalidId(String),

    #[error("gateway not connected yet, no cache available")]
    NotConnected,
}

/// Parse a decimal snowflake; zero is rejected because serenity IDs are non-zero.
pub(crate) fn parse_snowflake(raw: &str) -> Result<u64, DiscordError> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .ok_or_else(|| DiscordError::InvalidId(raw.to_string()))
}
